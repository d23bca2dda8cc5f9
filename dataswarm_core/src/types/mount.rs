use std::fmt;

use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};

bitflags! {
    /// Access a task has to a mounted blob. Written as a mode string such as `"R"` or `"RW"`.
    pub struct MountFlags: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        const APPEND = 0x04;
    }
}

impl MountFlags {
    pub fn parse(mode: &str) -> Option<MountFlags> {
        let mut flags = MountFlags::empty();
        for c in mode.chars() {
            flags |= match c {
                'R' | 'r' => MountFlags::READ,
                'W' | 'w' => MountFlags::WRITE,
                'A' | 'a' => MountFlags::APPEND,
                _ => return None,
            };
        }
        if flags.is_empty() {
            None
        } else {
            Some(flags)
        }
    }

    /// Read-only mounts consume a committed blob; anything else produces one.
    #[inline]
    pub fn is_read_only(&self) -> bool {
        *self == MountFlags::READ
    }
}

impl fmt::Display for MountFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.contains(MountFlags::READ) {
            f.write_str("R")?;
        }
        if self.contains(MountFlags::WRITE) {
            f.write_str("W")?;
        }
        if self.contains(MountFlags::APPEND) {
            f.write_str("A")?;
        }
        Ok(())
    }
}

impl Serialize for MountFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> ::std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MountFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> ::std::result::Result<Self, D::Error> {
        let mode = String::deserialize(deserializer)?;
        MountFlags::parse(&mode).ok_or_else(|| de::Error::custom(format!("invalid mount mode {:?}", mode)))
    }
}

/// Where a blob appears inside the task sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountType {
    /// A symlink named `path` pointing at the blob data.
    Path,
    Stdin,
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Mount {
    #[serde(rename = "type")]
    pub kind: MountType,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub path: Option<String>,

    #[serde(rename = "mode")]
    pub flags: MountFlags,
}

impl Mount {
    pub fn path(path: &str, flags: MountFlags) -> Self {
        Mount {
            kind: MountType::Path,
            path: Some(path.to_string()),
            flags,
        }
    }

    pub fn stream(kind: MountType, flags: MountFlags) -> Self {
        Mount {
            kind,
            path: None,
            flags,
        }
    }

    /// A path mount needs a relative single-component name; stdin must be read-only
    /// and stdout/stderr must be writable.
    pub fn validate(&self) -> bool {
        match self.kind {
            MountType::Path => match self.path {
                Some(ref p) => {
                    !p.is_empty() && !p.starts_with('/') && !p.split('/').any(|c| c == "..")
                }
                None => false,
            },
            MountType::Stdin => self.flags.is_read_only(),
            MountType::Stdout | MountType::Stderr => {
                self.flags.intersects(MountFlags::WRITE | MountFlags::APPEND)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_strings() {
        assert_eq!(MountFlags::parse("R"), Some(MountFlags::READ));
        assert_eq!(MountFlags::parse("rw"), Some(MountFlags::READ | MountFlags::WRITE));
        assert_eq!(MountFlags::parse(""), None);
        assert_eq!(MountFlags::parse("RX"), None);
        assert_eq!((MountFlags::WRITE | MountFlags::APPEND).to_string(), "WA");
        assert!(MountFlags::READ.is_read_only());
        assert!(!(MountFlags::READ | MountFlags::WRITE).is_read_only());
    }

    #[test]
    fn mount_json() {
        let m: Mount = ::serde_json::from_value(json!({"type": "path", "path": "myinput", "mode": "R"})).unwrap();
        assert_eq!(m, Mount::path("myinput", MountFlags::READ));
        assert!(m.validate());

        let out = Mount::stream(MountType::Stdout, MountFlags::WRITE);
        assert_eq!(::serde_json::to_value(&out).unwrap(), json!({"type": "stdout", "mode": "W"}));
        assert!(out.validate());

        assert!(!Mount::stream(MountType::Stdin, MountFlags::WRITE).validate());
        assert!(!Mount::path("../escape", MountFlags::READ).validate());
        assert!(!Mount::path("/abs", MountFlags::READ).validate());
    }
}
