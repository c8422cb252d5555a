//! Dispatcher integration tests: create/destroy objects, permission
//! replies, broadcast fan-out, dirty marking, snapshot flush.

#[cfg(test)]
mod tests {
    use cyberspace_world::avatar::Avatar;
    use cyberspace_world::dispatch::{self, ConnectionCtx};
    use cyberspace_world::maintenance;
    use cyberspace_world::object::{ObjectKind, WorldObject};
    use cyberspace_world::protocol::{msg, ClientMessage};
    use cyberspace_world::records::{User, USER_WORLD_GARDENER_FLAG};
    use cyberspace_world::server::{ConnectionHandle, Server, ServerConfig};
    use cyberspace_world::store::RecordStore;
    use cyberspace_world::types::{Uid, UserId};
    use cyberspace_world::worlds::AllWorlds;
    use cyberspace_world::ResourceManager;
    use bytes::Bytes;
    use glam::DVec3;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct Fixture {
        server: Arc<Server>,
        ctx: ConnectionCtx,
        /// Outbound queue of the sender's own connection.
        rx_a: mpsc::Receiver<Bytes>,
        /// Outbound queue of a second subscribed connection.
        rx_b: mpsc::Receiver<Bytes>,
        _dir: tempfile::TempDir,
    }

    fn make_fixture(read_only: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            state_dir: dir.path().to_path_buf(),
            listen_port: 0,
            udp_port: 0,
            read_only,
            cert_file: dir.path().join("cert.pem"),
            key_file: dir.path().join("key.pem"),
        };
        let store = RecordStore::create(&config.records_file_path()).unwrap();
        let resources = ResourceManager::new(config.resources_dir());

        let mut state = AllWorlds::new();
        let user_id = state.alloc_user_id();
        let mut user = User::new(user_id, "alice");
        user.flags = USER_WORLD_GARDENER_FLAG;
        state.users.insert(user_id, user);
        state.db_dirty_users.insert(user_id);

        let avatar_a = state.alloc_avatar_uid();
        let avatar_b = state.alloc_avatar_uid();
        {
            let world = state.world_entry("");
            world
                .avatars
                .insert(avatar_a, Avatar::new(avatar_a, user_id, "alice"));
            world
                .avatars
                .insert(avatar_b, Avatar::new(avatar_b, UserId::INVALID, "bob"));
        }

        let (lod_tx, _lod_rx) = mpsc::unbounded_channel();
        let (npc_tx, _npc_rx) = mpsc::unbounded_channel();
        let server = Arc::new(Server::new(config, state, store, resources, lod_tx, npc_tx));

        let (tx_a, rx_a) = mpsc::channel(2048);
        let (tx_b, rx_b) = mpsc::channel(2048);
        let addr = "127.0.0.1:1".parse().unwrap();
        server.register_connection(ConnectionHandle {
            id: 0,
            world_name: String::new(),
            avatar_uid: avatar_a,
            user_id,
            remote_addr: addr,
            client_udp_port: 0,
            sender: tx_a,
        });
        server.register_connection(ConnectionHandle {
            id: 1,
            world_name: String::new(),
            avatar_uid: avatar_b,
            user_id: UserId::INVALID,
            remote_addr: addr,
            client_udp_port: 0,
            sender: tx_b,
        });

        let mut ctx = ConnectionCtx::new(0, String::new(), avatar_a);
        ctx.user_id = user_id;
        Fixture {
            server,
            ctx,
            rx_a,
            rx_b,
            _dir: dir,
        }
    }

    fn frame_id(frame: &Bytes) -> u32 {
        u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]])
    }

    fn drain_ids(rx: &mut mpsc::Receiver<Bytes>) -> Vec<u32> {
        let mut ids = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            ids.push(frame_id(&frame));
        }
        ids
    }

    // -----------------------------------------------------------------------
    // Create / destroy
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn create_then_destroy_broadcasts_to_both_clients() {
        let mut fx = make_fixture(false);

        let mut ob = WorldObject::new(Uid::INVALID, ObjectKind::Generic, UserId::INVALID);
        ob.model_url = "cube_7.bmesh".to_string();
        ob.pos = DVec3::new(1.0, 2.0, 3.0);
        dispatch::handle_message(&fx.server, &mut fx.ctx, ClientMessage::CreateObject {
            object: ob,
        })
        .await
        .unwrap();

        let ids_a = drain_ids(&mut fx.rx_a);
        let ids_b = drain_ids(&mut fx.rx_b);
        assert_eq!(ids_a, vec![msg::OBJECT_CREATED]);
        assert_eq!(ids_b, vec![msg::OBJECT_CREATED]);

        // The object landed in the world with a fresh UID, marked dirty.
        let uid = {
            let state = fx.server.state.lock();
            let world = state.world("").unwrap();
            assert_eq!(world.objects.len(), 1);
            let uid = *world.objects.keys().next().unwrap();
            assert!(world.db_dirty_objects.contains(&uid));
            assert!(world.chunks.values().any(|c| c.needs_rebuild));
            uid
        };

        dispatch::handle_message(&fx.server, &mut fx.ctx, ClientMessage::DestroyObject { uid })
            .await
            .unwrap();
        assert_eq!(drain_ids(&mut fx.rx_a), vec![msg::OBJECT_DESTROYED]);
        assert_eq!(drain_ids(&mut fx.rx_b), vec![msg::OBJECT_DESTROYED]);

        // Logically dead until the sweep reaps it.
        {
            let state = fx.server.state.lock();
            assert!(state.world("").unwrap().objects[&uid].dead);
        }
        maintenance::run_sweep_once(&fx.server);
        {
            let state = fx.server.state.lock();
            assert!(!state.world("").unwrap().objects.contains_key(&uid));
        }
    }

    #[tokio::test]
    async fn anonymous_sender_gets_permission_denied() {
        let mut fx = make_fixture(false);
        fx.ctx.user_id = UserId::INVALID;

        let ob = WorldObject::new(Uid::INVALID, ObjectKind::Generic, UserId::INVALID);
        dispatch::handle_message(&fx.server, &mut fx.ctx, ClientMessage::CreateObject {
            object: ob,
        })
        .await
        .unwrap();

        assert_eq!(drain_ids(&mut fx.rx_a), vec![msg::PERMISSION_DENIED]);
        assert!(drain_ids(&mut fx.rx_b).is_empty());
        let state = fx.server.state.lock();
        assert!(state.world("").unwrap().objects.is_empty());
    }

    #[tokio::test]
    async fn read_only_mode_rejects_mutations() {
        let mut fx = make_fixture(true);
        let ob = WorldObject::new(Uid::INVALID, ObjectKind::Generic, UserId::INVALID);
        dispatch::handle_message(&fx.server, &mut fx.ctx, ClientMessage::CreateObject {
            object: ob,
        })
        .await
        .unwrap();
        assert_eq!(drain_ids(&mut fx.rx_a), vec![msg::READ_ONLY_MODE]);
        let state = fx.server.state.lock();
        assert!(state.world("").unwrap().objects.is_empty());
    }

    // -----------------------------------------------------------------------
    // Chat and transforms
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn chat_is_tagged_and_broadcast_to_everyone() {
        let mut fx = make_fixture(false);
        dispatch::handle_message(&fx.server, &mut fx.ctx, ClientMessage::ChatMessage {
            body: "hello world".to_string(),
        })
        .await
        .unwrap();

        let frame = fx.rx_b.try_recv().unwrap();
        assert_eq!(frame_id(&frame), msg::CHAT_MESSAGE);
        // Sender also hears their own chat.
        assert_eq!(drain_ids(&mut fx.rx_a), vec![msg::CHAT_MESSAGE]);
    }

    #[tokio::test]
    async fn transform_updates_are_rate_limited() {
        let mut fx = make_fixture(false);
        for i in 0..30 {
            dispatch::handle_message(&fx.server, &mut fx.ctx, ClientMessage::AvatarTransformUpdate {
                pos: DVec3::new(i as f64, 0.0, 0.0),
                axis: glam::Vec3::Z,
                angle: 0.0,
                anim_state: 0,
            })
            .await
            .unwrap();
        }
        // 30 rapid-fire updates coalesce to a single forwarded frame; the
        // sender sees none of them.
        let forwarded = drain_ids(&mut fx.rx_b);
        assert_eq!(forwarded, vec![msg::AVATAR_TRANSFORM_UPDATE]);
        assert!(drain_ids(&mut fx.rx_a).is_empty());

        // The live pose is the latest one regardless.
        let state = fx.server.state.lock();
        let avatar = &state.world("").unwrap().avatars[&fx.ctx.avatar_uid];
        assert_eq!(avatar.pos.x, 29.0);
    }

    #[tokio::test]
    async fn non_finite_pose_is_a_protocol_error() {
        let mut fx = make_fixture(false);
        let result = dispatch::handle_message(
            &fx.server,
            &mut fx.ctx,
            ClientMessage::AvatarTransformUpdate {
                pos: DVec3::new(f64::NAN, 0.0, 0.0),
                axis: glam::Vec3::Z,
                angle: 0.0,
                anim_state: 0,
            },
        )
        .await;
        assert!(result.is_err());
    }

    // -----------------------------------------------------------------------
    // Script changes mark chunks for rebuild
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn setting_a_script_marks_the_chunk_for_rebuild() {
        let mut fx = make_fixture(false);
        let mut ob = WorldObject::new(Uid::INVALID, ObjectKind::Generic, UserId::INVALID);
        ob.pos = DVec3::new(10.0, 10.0, 0.0);
        dispatch::handle_message(&fx.server, &mut fx.ctx, ClientMessage::CreateObject {
            object: ob,
        })
        .await
        .unwrap();

        let (uid, coords) = {
            let mut state = fx.server.state.lock();
            let world = state.world_mut("").unwrap();
            let uid = *world.objects.keys().next().unwrap();
            let coords = world.objects[&uid].home_chunk();
            // Simulate the baker having finished.
            world.chunk_entry(coords).needs_rebuild = false;
            world.db_dirty_chunks.clear();
            (uid, coords)
        };

        let mut updated = {
            let state = fx.server.state.lock();
            state.world("").unwrap().objects[&uid].clone()
        };
        updated.script = "print('hi')".to_string();
        dispatch::handle_message(&fx.server, &mut fx.ctx, ClientMessage::ObjectFullUpdate {
            object: updated,
        })
        .await
        .unwrap();

        let state = fx.server.state.lock();
        let world = state.world("").unwrap();
        assert!(world.chunks[&coords].needs_rebuild);
        assert!(world.db_dirty_chunks.contains(&coords));
    }

    // -----------------------------------------------------------------------
    // Snapshotter
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn flush_persists_created_objects_across_reload() {
        let mut fx = make_fixture(false);
        let mut ob = WorldObject::new(Uid::INVALID, ObjectKind::Generic, UserId::INVALID);
        ob.model_url = "cube_7.bmesh".to_string();
        dispatch::handle_message(&fx.server, &mut fx.ctx, ClientMessage::CreateObject {
            object: ob,
        })
        .await
        .unwrap();

        maintenance::flush_dirty(&fx.server).unwrap();

        // Reload from the same store.
        let mut reloaded = AllWorlds::new();
        {
            let mut store = fx.server.store.lock();
            reloaded.load(&mut store, &fx.server.resources).unwrap();
        }
        let world = reloaded.world("").unwrap();
        assert_eq!(world.objects.len(), 1);
        let ob = world.objects.values().next().unwrap();
        assert_eq!(ob.model_url, "cube_7.bmesh");
        assert_eq!(ob.creator_name, "alice", "denormalised on load");
        assert!(ob.record_key.valid());
    }
}
