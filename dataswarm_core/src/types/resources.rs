/// Cores, memory (MB) and disk (MB), compared and combined component-wise.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub cores: u64,
    #[serde(default)]
    pub memory: u64,
    #[serde(default)]
    pub disk: u64,
}

impl Resources {
    pub fn new(cores: u64, memory: u64, disk: u64) -> Self {
        Resources {
            cores,
            memory,
            disk,
        }
    }

    pub fn add(&mut self, resources: &Resources) {
        self.cores += resources.cores;
        self.memory += resources.memory;
        self.disk += resources.disk;
    }

    pub fn remove(&mut self, resources: &Resources) {
        debug_assert!(resources.is_subset_of(self));
        self.cores = self.cores.saturating_sub(resources.cores);
        self.memory = self.memory.saturating_sub(resources.memory);
        self.disk = self.disk.saturating_sub(resources.disk);
    }

    pub fn difference(&self, resources: &Resources) -> Resources {
        let mut r = *self;
        r.remove(resources);
        r
    }

    #[inline]
    pub fn is_subset_of(&self, resources: &Resources) -> bool {
        self.cores <= resources.cores
            && self.memory <= resources.memory
            && self.disk <= resources.disk
    }

    /// Only disk, the part of a task's reservation that outlives its process.
    pub fn disk_only(&self) -> Resources {
        Resources::new(0, 0, self.disk)
    }

    /// Everything except disk.
    pub fn without_disk(&self) -> Resources {
        Resources::new(self.cores, self.memory, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn componentwise() {
        let mut total = Resources::new(4, 1000, 5000);
        let task = Resources::new(1, 200, 100);
        assert!(task.is_subset_of(&total));
        assert!(!Resources::new(5, 0, 0).is_subset_of(&total));
        assert!(!Resources::new(0, 0, 5001).is_subset_of(&total));

        total.remove(&task);
        assert_eq!(total, Resources::new(3, 800, 4900));
        total.add(&task.without_disk());
        assert_eq!(total, Resources::new(4, 1000, 4900));
        assert_eq!(total.difference(&task.disk_only()), Resources::new(4, 1000, 4800));
    }

    #[test]
    fn missing_fields_default_to_zero() {
        let r: Resources = ::serde_json::from_str(r#"{"cores": 2}"#).unwrap();
        assert_eq!(r, Resources::new(2, 0, 0));
    }
}
