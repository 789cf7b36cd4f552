//! Process-wide store of validated per-user agent configuration.
//!
//! `set_profile` must precede `join_room` to take effect for agent
//! initialization: the room copies the profile at join time and never reads
//! the store again for that membership.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::domain::ids::UserId;
use crate::domain::profile::UserProfile;

#[derive(Default)]
pub struct ProfileStore {
    profiles: RwLock<HashMap<UserId, UserProfile>>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the validated form of a profile.
    pub fn set(&self, profile: UserProfile) {
        let profile = profile.validated();
        self.profiles
            .write()
            .insert(profile.user_id.clone(), profile);
    }

    pub fn get(&self, user: &UserId) -> Option<UserProfile> {
        self.profiles.read().get(user).cloned()
    }

    /// The stored profile, or a minimal default for users who never sent
    /// `set_profile`.
    pub fn get_or_default(&self, user: &UserId) -> UserProfile {
        self.get(user)
            .unwrap_or_else(|| UserProfile::default_for(user.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_the_validated_form() {
        let store = ProfileStore::new();
        let user = UserId::parse("alice").unwrap();
        let mut profile = UserProfile::default_for(user.clone());
        profile.display_name = "  Alice  ".to_string();
        store.set(profile);

        assert_eq!(store.get(&user).unwrap().display_name, "Alice");
    }

    #[test]
    fn default_profile_for_unknown_user() {
        let store = ProfileStore::new();
        let user = UserId::parse("ghost").unwrap();
        let profile = store.get_or_default(&user);
        assert_eq!(profile.display_name, "ghost");
    }
}
