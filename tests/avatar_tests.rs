//! Avatar snapshot-ring tests: interpolated playback is a pure function of
//! the ring buffer and a clock.

#[cfg(test)]
mod tests {
    use cyberspace_world::avatar::{Avatar, PoseHistory, PoseSnapshot};
    use cyberspace_world::types::{Uid, UserId};
    use glam::{DVec3, Vec3};

    fn snapshot(x: f64, time: f64) -> PoseSnapshot {
        PoseSnapshot {
            pos: DVec3::new(x, 0.0, 0.0),
            axis: Vec3::Z,
            angle: 0.0,
            time,
        }
    }

    // -----------------------------------------------------------------------
    // Ring behaviour
    // -----------------------------------------------------------------------

    #[test]
    fn empty_history_has_no_pose() {
        let history = PoseHistory::default();
        assert!(history.latest().is_none());
        assert!(history.interpolated(1.0).is_none());
    }

    #[test]
    fn latest_returns_most_recent_snapshot() {
        let mut history = PoseHistory::default();
        for i in 0..6 {
            history.push(snapshot(i as f64, i as f64));
        }
        // More pushes than slots: the ring keeps only the newest four.
        assert_eq!(history.latest().unwrap().pos.x, 5.0);
    }

    #[test]
    fn interpolation_between_snapshots_is_linear() {
        let mut history = PoseHistory::default();
        history.push(snapshot(0.0, 10.0));
        history.push(snapshot(4.0, 11.0));

        let mid = history.interpolated(10.5).unwrap();
        assert!((mid.pos.x - 2.0).abs() < 1e-9);

        let quarter = history.interpolated(10.25).unwrap();
        assert!((quarter.pos.x - 1.0).abs() < 1e-9);
    }

    #[test]
    fn interpolation_clamps_to_newest() {
        let mut history = PoseHistory::default();
        history.push(snapshot(1.0, 10.0));
        history.push(snapshot(2.0, 11.0));
        // A clock ahead of the newest snapshot pins to the newest pose.
        assert_eq!(history.interpolated(99.0).unwrap().pos.x, 2.0);
    }

    // -----------------------------------------------------------------------
    // Avatar integration
    // -----------------------------------------------------------------------

    #[test]
    fn set_transform_updates_live_pose_and_ring() {
        let mut avatar = Avatar::new(Uid(1), UserId::INVALID, "alice");
        avatar.set_transform(DVec3::new(5.0, 0.0, 0.0), Vec3::Z, 0.5, 100.0);
        avatar.set_transform(DVec3::new(7.0, 0.0, 0.0), Vec3::Z, 0.6, 100.1);

        assert_eq!(avatar.pos.x, 7.0);
        assert_eq!(avatar.history.latest().unwrap().pos.x, 7.0);
        let between = avatar.history.interpolated(100.05).unwrap();
        assert!(between.pos.x > 5.0 && between.pos.x < 7.0);
    }
}
