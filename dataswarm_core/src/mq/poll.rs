use std::collections::{HashMap, HashSet};
use std::time::Instant;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};

use super::connection::{ms_until, Connection};
use crate::errors::{ErrorKind, Result};

/// Handle of a connection owned by a `PollGroup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ::std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// A set of connections multiplexed by one event loop.
///
/// The group owns its members, so a connection can be in at most one group.
/// Readiness is level-triggered: a member stays acceptable/readable/errored until the
/// condition is consumed (`accept`, `recv`, `close`).
pub struct PollGroup<T> {
    members: HashMap<ConnId, Connection<T>>,
    next_id: u64,
    acceptable: HashSet<ConnId>,
    readable: HashSet<ConnId>,
    error: HashSet<ConnId>,
}

impl<T> Default for PollGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PollGroup<T> {
    pub fn new() -> Self {
        PollGroup {
            members: HashMap::new(),
            next_id: 1,
            acceptable: HashSet::new(),
            readable: HashSet::new(),
            error: HashSet::new(),
        }
    }

    pub fn add(&mut self, conn: Connection<T>) -> ConnId {
        let id = ConnId(self.next_id);
        self.next_id += 1;
        self.members.insert(id, conn);
        self.update(id);
        id
    }

    /// Remove a member and hand it back to the caller.
    pub fn rm(&mut self, id: ConnId) -> Option<Connection<T>> {
        self.acceptable.remove(&id);
        self.readable.remove(&id);
        self.error.remove(&id);
        self.members.remove(&id)
    }

    /// Remove and drop a member, releasing everything queued on it.
    pub fn close(&mut self, id: ConnId) {
        if self.rm(id).is_some() {
            debug!("Closed {}", id);
        }
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection<T>> {
        self.members.get(&id)
    }

    /// Mutable access to a member. Call `update` after changing its receive or send state
    /// outside of `poll_wait` so the ready sets stay accurate.
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection<T>> {
        self.members.get_mut(&id)
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn ids(&self) -> Vec<ConnId> {
        self.members.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnId, &Connection<T>)> {
        self.members.iter().map(|(id, conn)| (*id, conn))
    }

    /// Refresh the ready sets for one member.
    pub fn update(&mut self, id: ConnId) {
        let (acceptable, readable, error) = match self.members.get(&id) {
            Some(conn) => (conn.is_acceptable(), conn.is_readable(), conn.is_error()),
            None => (false, false, false),
        };
        set_membership(&mut self.acceptable, id, acceptable);
        set_membership(&mut self.readable, id, readable);
        set_membership(&mut self.error, id, error);
    }

    fn count_ready(&self) -> usize {
        self.acceptable.len() + self.readable.len() + self.error.len()
    }

    /// Flush every member once, then block until some member becomes ready or `stoptime`.
    ///
    /// Returns the number of ready events; 0 on timeout or when interrupted by a signal.
    pub fn poll_wait(&mut self, stoptime: Instant) -> Result<usize> {
        loop {
            let ids = self.ids();
            for &id in &ids {
                if let Some(conn) = self.members.get_mut(&id) {
                    conn.flush();
                }
                self.update(id);
            }
            let ready = self.count_ready();
            if ready > 0 {
                return Ok(ready);
            }

            let timeout = ms_until(stoptime);
            if timeout == 0 {
                return Ok(0);
            }
            let mut fds: Vec<PollFd> = ids
                .iter()
                .map(|id| {
                    let conn = &self.members[id];
                    PollFd::new(conn.raw_fd(), conn.poll_events())
                })
                .collect();
            match poll(&mut fds, timeout) {
                Ok(0) => return Ok(0),
                Ok(_) => {
                    for (id, fd) in ids.iter().zip(fds.iter()) {
                        let revents = fd.revents().unwrap_or_else(PollFlags::empty);
                        if revents.is_empty() {
                            continue;
                        }
                        if let Some(conn) = self.members.get_mut(id) {
                            conn.handle_revents(revents);
                        }
                        self.update(*id);
                    }
                    let ready = self.count_ready();
                    if ready > 0 {
                        return Ok(ready);
                    }
                }
                Err(Errno::EINTR) => return Ok(0),
                Err(e) => return Err(ErrorKind::Transport(e).into()),
            }
        }
    }

    fn ready_set(&mut self, which: Ready) -> &mut HashSet<ConnId> {
        match which {
            Ready::Acceptable => &mut self.acceptable,
            Ready::Readable => &mut self.readable,
            Ready::Error => &mut self.error,
        }
    }

    /// Pick one member from a ready set, dropping entries whose condition no longer holds.
    fn pick(&mut self, which: Ready, check: fn(&Connection<T>) -> bool) -> Option<ConnId> {
        loop {
            let candidate = self.ready_set(which).iter().next().cloned()?;
            if self.members.get(&candidate).map_or(false, check) {
                return Some(candidate);
            }
            self.ready_set(which).remove(&candidate);
        }
    }

    /// A server member with a pending connection, if any.
    pub fn poll_acceptable(&mut self) -> Option<ConnId> {
        self.pick(Ready::Acceptable, Connection::is_acceptable)
    }

    /// A member holding a completely received message, if any.
    pub fn poll_readable(&mut self) -> Option<ConnId> {
        self.pick(Ready::Readable, Connection::is_readable)
    }

    /// A member in the error state, if any.
    pub fn poll_error(&mut self) -> Option<ConnId> {
        self.pick(Ready::Error, Connection::is_error)
    }
}

#[derive(Clone, Copy)]
enum Ready {
    Acceptable,
    Readable,
    Error,
}

fn set_membership(set: &mut HashSet<ConnId>, id: ConnId, present: bool) {
    if present {
        set.insert(id);
    } else {
        set.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::super::connection::tests::deadline;
    use super::super::message::Message;
    use super::*;
    use std::time::Duration;

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(20)
    }

    #[test]
    fn accept_and_read_through_group() {
        let mut group: PollGroup<&'static str> = PollGroup::new();
        let server = Connection::serve(Some("127.0.0.1"), 0).unwrap();
        let port = server.local_addr().unwrap().port();
        let server = group.add(server);

        let mut client = Connection::<&'static str>::connect("127.0.0.1", port).unwrap();
        client.send_buffer(b"ping".to_vec(), 0).unwrap();
        client.wait(soon()).unwrap();

        assert!(group.poll_wait(deadline(5)).unwrap() > 0);
        assert_eq!(group.poll_acceptable(), Some(server));
        let mut accepted = group.get_mut(server).unwrap().accept().unwrap();
        group.update(server);
        assert_eq!(group.poll_acceptable(), None);

        accepted.set_tag("peer");
        accepted.store_buffer(Vec::new(), 0).unwrap();
        let peer = group.add(accepted);

        let stop = deadline(10);
        while group.poll_readable().is_none() {
            client.wait(soon()).unwrap();
            group.poll_wait(soon()).unwrap();
            assert!(Instant::now() < stop);
        }
        assert_eq!(group.poll_readable(), Some(peer));
        assert_eq!(group.get(peer).unwrap().tag(), Some(&"peer"));

        // level-triggered: still readable until drained
        group.poll_wait(soon()).unwrap();
        group.poll_wait(soon()).unwrap();
        assert_eq!(group.poll_readable(), Some(peer));

        match group.get_mut(peer).unwrap().recv() {
            Some(Message::Buffer(buf)) => assert_eq!(buf, b"ping".to_vec()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(group.poll_readable(), None);
    }

    #[test]
    fn errors_surface_and_close_removes() {
        let mut group: PollGroup<()> = PollGroup::new();
        let (client, mut accepted) = super::super::connection::tests::pair();
        accepted.store_buffer(Vec::new(), 0).unwrap();
        let id = group.add(accepted);
        drop(client);

        let stop = deadline(5);
        while group.poll_error().is_none() {
            group.poll_wait(soon()).unwrap();
            assert!(Instant::now() < stop);
        }
        assert_eq!(group.poll_error(), Some(id));
        group.close(id);
        assert_eq!(group.poll_error(), None);
        assert!(group.get(id).is_none());
        assert!(group.is_empty());
    }

    #[test]
    fn timeout_returns_zero() {
        let mut group: PollGroup<()> = PollGroup::new();
        let server = Connection::serve(Some("127.0.0.1"), 0).unwrap();
        group.add(server);
        let start = Instant::now();
        assert_eq!(group.poll_wait(start + Duration::from_millis(50)).unwrap(), 0);
        assert!(Instant::now() >= start + Duration::from_millis(40));
    }

    #[test]
    fn rm_returns_connection() {
        let mut group: PollGroup<u32> = PollGroup::new();
        let mut server = Connection::serve(Some("127.0.0.1"), 0).unwrap();
        server.set_tag(7);
        let id = group.add(server);
        let back = group.rm(id).unwrap();
        assert_eq!(back.tag(), Some(&7));
        assert!(!group.contains(id));
    }
}
