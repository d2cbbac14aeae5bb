use bulwark_engine::testkit::MockWorld;
use bulwark_engine::{BufferPools, ChangeAction, ChangeOutcome, RecordState, RecordTable};
use bulwark_model::{UserId, Vec3, ZonePartitioner};
use chrono::{TimeZone, Utc};
use proptest::prelude::*;

const IN_FLIGHT: [RecordState; 4] = [
    RecordState::Processing,
    RecordState::SaveBuildingNetwork,
    RecordState::SaveFindingEntities,
    RecordState::SaveWriting,
];

fn action() -> impl Strategy<Value = ChangeAction> {
    prop_oneof![
        Just(ChangeAction::Create),
        Just(ChangeAction::Update),
        Just(ChangeAction::Decay),
        Just(ChangeAction::Kill),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn in_flight_records_never_regress(
        start in 0usize..IN_FLIGHT.len(),
        changes in proptest::collection::vec((action(), 0usize..4, any::<bool>()), 1..40),
    ) {
        let mut world = MockWorld::new();
        let controller = world.add_controller(Vec3::ZERO);
        let blocks: Vec<_> = (0..4)
            .map(|i| world.add_block(controller, Vec3::new(3.0 * i as f32, 0.0, 0.0)))
            .collect();
        let pools = BufferPools::new();
        let mut table = RecordTable::new(ZonePartitioner::new(40.0, 100.0).unwrap());
        let object = world.get(controller).unwrap().clone();
        table.start_recording(&world, &pools, &object).unwrap();
        table.update(controller, IN_FLIGHT[start]).unwrap();

        let now = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        for (n, (action, which, by_player)) in changes.iter().enumerate() {
            let object = world.get(blocks[*which]).unwrap().clone();
            let actor = by_player.then_some(UserId(1));
            let outcome = table
                .handle_change(&world, &pools, &object, *action, actor, now)
                .unwrap();
            prop_assert_eq!(
                outcome,
                ChangeOutcome::Logged { controller, state: IN_FLIGHT[start] }
            );
            let record = table.get(controller).unwrap();
            prop_assert_eq!(record.state(), IN_FLIGHT[start]);
            prop_assert_eq!(record.change_log().len(), n + 1);
        }
        prop_assert!(table.get(controller).unwrap().zones_dirty());
    }
}

#[test]
fn change_after_success_marks_modified_and_in_processing_is_only_logged() {
    let mut world = MockWorld::new();
    let controller = world.add_controller(Vec3::ZERO);
    let block = world.add_block(controller, Vec3::new(3.0, 0.0, 0.0));
    let pools = BufferPools::new();
    let mut table = RecordTable::new(ZonePartitioner::new(40.0, 100.0).unwrap());
    let object = world.get(controller).unwrap().clone();
    table.start_recording(&world, &pools, &object).unwrap();
    let now = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
    let change = world.get(block).unwrap().clone();

    table.update(controller, RecordState::SaveSuccess).unwrap();
    table
        .handle_change(&world, &pools, &change, ChangeAction::Update, None, now)
        .unwrap();
    assert_eq!(table.get(controller).unwrap().state(), RecordState::Modified);

    table.update(controller, RecordState::Processing).unwrap();
    table
        .handle_change(&world, &pools, &change, ChangeAction::Decay, None, now)
        .unwrap();
    let record = table.get(controller).unwrap();
    assert_eq!(record.state(), RecordState::Processing);
    assert_eq!(record.change_log().len(), 2);
}
