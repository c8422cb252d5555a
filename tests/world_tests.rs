//! World-state tests: authorisation, denormalisation, migrations.

#[cfg(test)]
mod tests {
    use cyberspace_world::dispatch::{user_may_create_object_at, user_may_modify_object};
    use cyberspace_world::object::{ObjectKind, WorldObject, AUDIO_AUTOPLAY_FLAG, AUDIO_LOOP_FLAG};
    use cyberspace_world::parcel::Parcel;
    use cyberspace_world::records::{User, USER_SERVER_ADMIN_FLAG, USER_WORLD_GARDENER_FLAG};
    use cyberspace_world::types::{Uid, UserId};
    use cyberspace_world::worlds::AllWorlds;
    use glam::{DVec2, DVec3};

    fn add_user(state: &mut AllWorlds, name: &str, flags: u32) -> UserId {
        let id = state.alloc_user_id();
        let mut user = User::new(id, name);
        user.flags = flags;
        state.users.insert(id, user);
        id
    }

    /// Root world with one parcel (owner u1, writer u2) and one object in it.
    fn make_state() -> (AllWorlds, UserId, UserId, UserId, Uid) {
        let mut state = AllWorlds::new();
        let u1 = add_user(&mut state, "owner", 0);
        let u2 = add_user(&mut state, "writer", 0);
        let u3 = add_user(&mut state, "stranger", 0);

        let uid = state.alloc_object_uid();
        {
            let world = state.world_entry("");
            let mut parcel = Parcel::new(1, u1);
            parcel.writer_ids = vec![u2];
            parcel.verts = [
                DVec2::new(0.0, 0.0),
                DVec2::new(50.0, 0.0),
                DVec2::new(50.0, 50.0),
                DVec2::new(0.0, 50.0),
            ];
            parcel.zbounds = (-10.0, 100.0);
            parcel.build_aabb();
            world.parcels.insert(1, parcel);

            let mut ob = WorldObject::new(uid, ObjectKind::Generic, u1);
            ob.pos = DVec3::new(25.0, 25.0, 1.0);
            ob.update_world_aabb();
            world.objects.insert(uid, ob);
        }
        (state, u1, u2, u3, uid)
    }

    // -----------------------------------------------------------------------
    // Authorisation
    // -----------------------------------------------------------------------

    #[test]
    fn parcel_owner_and_writer_may_modify_stranger_may_not() {
        let (state, u1, u2, u3, uid) = make_state();
        let ob = state.world("").unwrap().objects.get(&uid).unwrap();

        assert!(user_may_modify_object(&state, "", ob, u1)); // parcel owner
        assert!(user_may_modify_object(&state, "", ob, u2)); // listed writer
        assert!(!user_may_modify_object(&state, "", ob, u3)); // stranger
        assert!(!user_may_modify_object(&state, "", ob, UserId::INVALID)); // anonymous
    }

    #[test]
    fn outside_parcels_only_gardener_or_admin_may_create() {
        let mut state = AllWorlds::new();
        let normal = add_user(&mut state, "normal", 0);
        let gardener = add_user(&mut state, "gardener", USER_WORLD_GARDENER_FLAG);
        let admin = add_user(&mut state, "admin", USER_SERVER_ADMIN_FLAG);
        let outside = DVec3::new(5000.0, 5000.0, 0.0);

        assert!(!user_may_create_object_at(&state, "", outside, normal));
        assert!(user_may_create_object_at(&state, "", outside, gardener));
        assert!(user_may_create_object_at(&state, "", outside, admin));
    }

    #[test]
    fn admin_may_modify_anything() {
        let (mut state, _u1, _u2, _u3, uid) = make_state();
        let admin = add_user(&mut state, "admin", USER_SERVER_ADMIN_FLAG);
        let ob = state.world("").unwrap().objects.get(&uid).unwrap();
        assert!(user_may_modify_object(&state, "", ob, admin));
    }

    #[test]
    fn creator_may_modify_own_object_anywhere() {
        let mut state = AllWorlds::new();
        let creator = add_user(&mut state, "creator", 0);
        let uid = state.alloc_object_uid();
        let mut ob = WorldObject::new(uid, ObjectKind::Generic, creator);
        ob.pos = DVec3::new(9000.0, 9000.0, 0.0); // outside any parcel
        ob.update_world_aabb();
        state.world_entry("").objects.insert(uid, ob);

        let ob = state.world("").unwrap().objects.get(&uid).unwrap();
        assert!(user_may_modify_object(&state, "", ob, creator));
    }

    #[test]
    fn world_owner_gets_no_special_treatment_outside_parcels() {
        // Owning a world is not a build permission: outside any parcel only
        // gardeners and admins may create, even in the owner's own world.
        let mut state = AllWorlds::new();
        let alice = add_user(&mut state, "alice", 0);
        state.world_entry("alice").owner_id = alice;
        let pos = DVec3::new(0.0, 0.0, 0.0);
        assert!(!user_may_create_object_at(&state, "alice", pos, alice));

        let gardener = add_user(&mut state, "gardener", USER_WORLD_GARDENER_FLAG);
        assert!(user_may_create_object_at(&state, "alice", pos, gardener));
    }

    // -----------------------------------------------------------------------
    // Denormalisation
    // -----------------------------------------------------------------------

    #[test]
    fn denormalise_fills_display_names() {
        let (mut state, _u1, _u2, _u3, uid) = make_state();
        state.denormalise_data();

        let world = state.world("").unwrap();
        assert_eq!(world.objects[&uid].creator_name, "owner");
        let parcel = &world.parcels[&1];
        assert_eq!(parcel.owner_name, "owner");
        assert_eq!(parcel.writer_names, vec!["writer".to_string()]);
    }

    // -----------------------------------------------------------------------
    // Migrations
    // -----------------------------------------------------------------------

    #[test]
    fn migration_sets_audio_flags_and_personal_worlds() {
        let mut state = AllWorlds::new();
        let alice = add_user(&mut state, "alice", 0);
        let uid = state.alloc_object_uid();
        let mut ob = WorldObject::new(uid, ObjectKind::Generic, alice);
        ob.audio_url = "song_3.mp3".to_string();
        state.world_entry("").objects.insert(uid, ob);

        state.run_migrations();

        let ob = &state.world("").unwrap().objects[&uid];
        assert_ne!(ob.flags & AUDIO_AUTOPLAY_FLAG, 0);
        assert_ne!(ob.flags & AUDIO_LOOP_FLAG, 0);
        assert!(state.world("alice").is_some(), "personal world created");
        assert!(state.migration_version.version >= 2);

        // Running again is a no-op (idempotent, gated on the version).
        let version = state.migration_version.version;
        state.run_migrations();
        assert_eq!(state.migration_version.version, version);
    }

    // -----------------------------------------------------------------------
    // First-run world creation
    // -----------------------------------------------------------------------

    #[test]
    fn initial_parcels_are_created_once() {
        let mut state = AllWorlds::new();
        cyberspace_world::creation::create_initial_parcels(&mut state);

        let count = state.world("").unwrap().parcels.len();
        assert!(count > 0);
        // Every created parcel is queued for persistence.
        assert_eq!(state.world("").unwrap().db_dirty_parcels.len(), count);
        // Exactly one sandbox parcel.
        let sandboxes = state
            .world("")
            .unwrap()
            .parcels
            .values()
            .filter(|p| p.all_writeable)
            .count();
        assert_eq!(sandboxes, 1);

        // Second run is a no-op.
        cyberspace_world::creation::create_initial_parcels(&mut state);
        assert_eq!(state.world("").unwrap().parcels.len(), count);
    }

    #[test]
    fn uid_counters_monotonic_after_allocation() {
        let mut state = AllWorlds::new();
        let a = state.alloc_object_uid();
        let b = state.alloc_object_uid();
        assert!(b.0 > a.0);
        let av1 = state.alloc_avatar_uid();
        let av2 = state.alloc_avatar_uid();
        assert!(av2.0 > av1.0);
    }
}
