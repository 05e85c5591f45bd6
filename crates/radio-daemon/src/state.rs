use radio_library::protocol::DaemonState;
use radio_library::StationRecord;
use tokio::sync::RwLock;

#[derive(Default)]
struct Snapshot {
    state: DaemonState,
    /// Whole library, unsorted, with listening totals filled in.
    library: Vec<StationRecord>,
}

/// Read side of the daemon: the latest snapshot published by `DaemonCore`.
/// Servers read from here; only the core writes.
#[derive(Default)]
pub struct StateManager {
    inner: RwLock<Snapshot>,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_state(&self) -> DaemonState {
        self.inner.read().await.state.clone()
    }

    pub async fn library(&self) -> Vec<StationRecord> {
        self.inner.read().await.library.clone()
    }

    /// Replace the snapshot, bumping `rev`.  Returns the new revision.
    pub async fn publish(&self, mut state: DaemonState, library: Vec<StationRecord>) -> u64 {
        let mut guard = self.inner.write().await;
        state.rev = guard.state.rev + 1;
        let rev = state.rev;
        *guard = Snapshot { state, library };
        rev
    }
}
