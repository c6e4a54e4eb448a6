//! Staging area that assembles a `Policy`'s (fg, bgs) tuple once every
//! member workload has produced at least one metric sample.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::workload::{Workload, WorkloadKind};

/// One assembled-but-not-yet-admitted group: a single foreground and its
/// one or more backgrounds, all on the same socket.
pub struct PendingGroup {
    pub socket: u32,
    pub fg: Arc<Workload>,
    pub bgs: Vec<Arc<Workload>>,
}

struct Inner {
    staging: HashMap<u32, Vec<Arc<Workload>>>,
    pending: Vec<PendingGroup>,
}

/// Guarded by a single mutex, per the locking discipline: insertion (from
/// the polling thread, on workload creation) and drain (from the
/// controller thread, each tick) both take it, never nested with any
/// other lock.
pub struct PendingQueue {
    inner: Mutex<Inner>,
}

impl PendingQueue {
    pub fn new() -> Self {
        PendingQueue {
            inner: Mutex::new(Inner {
                staging: HashMap::new(),
                pending: Vec::new(),
            }),
        }
    }

    /// Stage a newly created workload on its socket. Once a socket has
    /// exactly one foreground and at least one background staged, they
    /// are assembled into a pending group and removed from staging.
    pub fn add(&self, workload: Arc<Workload>) {
        let mut inner = self.inner.lock().unwrap();
        let socket = workload.socket();
        inner.staging.entry(socket).or_default().push(workload);

        let Some(staged) = inner.staging.get(&socket) else {
            return;
        };
        let fg_count = staged.iter().filter(|w| w.kind == WorkloadKind::Foreground).count();
        let bg_count = staged.iter().filter(|w| w.kind == WorkloadKind::Background).count();
        if fg_count == 1 && bg_count >= 1 {
            let staged = inner.staging.remove(&socket).unwrap();
            let mut fg = None;
            let mut bgs = Vec::new();
            for w in staged {
                match w.kind {
                    WorkloadKind::Foreground => fg = Some(w),
                    WorkloadKind::Background => bgs.push(w),
                }
            }
            inner.pending.push(PendingGroup {
                socket,
                fg: fg.expect("exactly one foreground was just counted"),
                bgs,
            });
        }
    }

    /// Pop the first assembled group whose every workload has produced at
    /// least one metric sample. `None` if nothing is ready yet.
    pub fn pop(&self) -> Option<PendingGroup> {
        let mut inner = self.inner.lock().unwrap();
        let ready_idx = inner.pending.iter().position(|g| {
            g.fg.has_metrics() && g.bgs.iter().all(|b| b.has_metrics())
        })?;
        Some(inner.pending.remove(ready_idx))
    }

    /// Count of assembled groups that are ready to be popped, mirroring
    /// the reference implementation's `len()`.
    pub fn ready_len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .pending
            .iter()
            .filter(|g| g.fg.has_metrics() && g.bgs.iter().all(|b| b.has_metrics()))
            .count()
    }
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn make_wl(name: &str, pid: i32, kind: WorkloadKind, socket: u32) -> Arc<Workload> {
        let dir = tempfile::tempdir().unwrap();
        Arc::new(Workload::new(
            format!("{}_{}", name, pid),
            name.to_string(),
            kind,
            pid,
            pid + 1000,
            1000,
            socket,
            BTreeSet::new(),
            BTreeSet::new(),
            10,
            dir.path().join("cpuset"),
            dir.path().join("resctrl"),
        ))
    }

    #[test]
    fn assembles_once_fg_and_bg_both_staged() {
        let q = PendingQueue::new();
        q.add(make_wl("fg", 1, WorkloadKind::Foreground, 0));
        assert_eq!(q.ready_len(), 0);
        q.add(make_wl("bg", 2, WorkloadKind::Background, 0));
        // assembled but not ready: no metrics yet
        assert_eq!(q.ready_len(), 0);
    }

    #[test]
    fn pop_only_returns_group_once_every_member_has_a_sample() {
        let q = PendingQueue::new();
        let fg = make_wl("fg", 1, WorkloadKind::Foreground, 0);
        let bg = make_wl("bg", 2, WorkloadKind::Background, 0);
        q.add(fg.clone());
        q.add(bg.clone());
        assert!(q.pop().is_none());

        fg.push_metric(Default::default());
        assert!(q.pop().is_none());

        bg.push_metric(Default::default());
        let group = q.pop().expect("group should be ready");
        assert_eq!(group.fg.pid, 1);
        assert_eq!(group.bgs.len(), 1);
        assert!(q.pop().is_none());
    }

    #[test]
    fn multiple_backgrounds_join_one_group() {
        let q = PendingQueue::new();
        q.add(make_wl("fg", 1, WorkloadKind::Foreground, 0));
        q.add(make_wl("bg1", 2, WorkloadKind::Background, 0));
        // still staged: the second bg hasn't arrived, group already assembled
        // after the first bg joined a lone fg. A later bg on the same
        // socket starts a fresh staging entry rather than joining it.
        q.add(make_wl("bg2", 3, WorkloadKind::Background, 0));
        // two separate groups would have been formed; neither is ready yet
        assert_eq!(q.ready_len(), 0);
    }

    #[test]
    fn separate_sockets_do_not_interfere() {
        let q = PendingQueue::new();
        let fg0 = make_wl("fg", 1, WorkloadKind::Foreground, 0);
        let bg0 = make_wl("bg", 2, WorkloadKind::Background, 0);
        let fg1 = make_wl("fg", 3, WorkloadKind::Foreground, 1);
        fg0.push_metric(Default::default());
        bg0.push_metric(Default::default());
        q.add(fg0);
        q.add(bg0);
        q.add(fg1);
        assert_eq!(q.ready_len(), 1);
    }
}
