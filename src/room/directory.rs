use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::info;

use crate::domain::ids::RoomId;
use crate::room::event::RoomHandle;
use crate::room::supervisor::{self, RoomDeps};

/// Process-wide map of live rooms. Rooms are created on first join and
/// pruned lazily once their supervising task has exited.
pub struct RoomDirectory {
    deps: RoomDeps,
    rooms: Mutex<HashMap<RoomId, RoomHandle>>,
}

impl RoomDirectory {
    pub fn new(deps: RoomDeps) -> Self {
        Self {
            deps,
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// The live room, or a freshly spawned one.
    pub fn get_or_create(&self, room_id: &RoomId) -> RoomHandle {
        let mut rooms = self.rooms.lock();
        if let Some(handle) = rooms.get(room_id) {
            if !handle.is_closed() {
                return handle.clone();
            }
        }
        info!(room = %room_id, "spawning room");
        let handle = supervisor::spawn(room_id.clone(), self.deps.clone());
        rooms.insert(room_id.clone(), handle.clone());
        handle
    }

    /// The live room, if any.
    pub fn get(&self, room_id: &RoomId) -> Option<RoomHandle> {
        let mut rooms = self.rooms.lock();
        match rooms.get(room_id) {
            Some(handle) if !handle.is_closed() => Some(handle.clone()),
            Some(_) => {
                rooms.remove(room_id);
                None
            }
            None => None,
        }
    }
}
