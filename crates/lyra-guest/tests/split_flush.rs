//! Submission splitting when the allocation table fills.

mod common;

use lyra_guest::alloc_table::{AccessKind, ResourceBinding};
use lyra_guest::config::DeviceConfig;
use lyra_guest::context::{DeviceContext, DeviceLayout};
use lyra_guest::submit::SubmitKind;
use lyra_mem::SharedMemory;
use lyra_protocol::cmd::opcode;

use common::MockDevice;

fn binding(id: u32) -> (ResourceBinding, AccessKind) {
    (
        ResourceBinding {
            alloc_id: id,
            gpa: 0x10_0000 + 0x1000 * id as u64,
            size_bytes: 0x1000,
        },
        AccessKind::Read,
    )
}

fn setup(table_slots: u32) -> (MockDevice, DeviceContext<SharedMemory>) {
    let config = DeviceConfig {
        ring_entry_count: 8,
        alloc_table_slots: table_slots,
        ..DeviceConfig::default()
    };
    let layout = DeviceLayout::compute(0, &config);
    let mem = SharedMemory::new(layout.total_bytes() as usize);
    let device = MockDevice::new(mem.clone(), layout.ring_gpa, layout.fence_page_gpa);
    let ctx = DeviceContext::create(mem, Box::new(device.clone()), config, 0).unwrap();
    (device, ctx)
}

#[test]
fn oversubscribed_operation_flushes_exactly_once() {
    // Table of four slots, two already referenced by earlier commands: the
    // remaining capacity (two) cannot hold the next operation's three
    // identities.
    let (device, ctx) = setup(4);

    ctx.append_fixed(opcode::NOP, &()).unwrap();
    ctx.track_for_op(&[binding(100), binding(101)]).unwrap();

    // {A, B, C} = {1, 2, 3}. The pre-scan must force one up-front flush and
    // land all three in the fresh table — never {A, B} in one submission
    // and a dangling C in the next. References are tracked before the
    // operation's commands are encoded, so the flush carries only the
    // earlier work.
    ctx.track_for_op(&[binding(1), binding(2), binding(3)])
        .unwrap();
    ctx.append_fixed(opcode::NOP, &()).unwrap();
    let final_fence = ctx.submit(SubmitKind::Render).unwrap();

    let submissions = device.submissions();
    assert_eq!(
        submissions.len(),
        2,
        "exactly one implicit flush plus the final submit"
    );
    assert_eq!(submissions[0].alloc_ids, vec![100, 101]);
    assert_eq!(submissions[1].alloc_ids, vec![1, 2, 3]);
    assert_eq!(submissions[1].fence, final_fence);
}

#[test]
fn fitting_operation_does_not_flush() {
    let (device, ctx) = setup(4);

    ctx.append_fixed(opcode::NOP, &()).unwrap();
    ctx.track_for_op(&[binding(1), binding(2)]).unwrap();
    ctx.track_for_op(&[binding(2), binding(3)]).unwrap();
    ctx.submit(SubmitKind::Render).unwrap();

    let submissions = device.submissions();
    assert_eq!(submissions.len(), 1);
    // Identity 2 was referenced by both operations and deduplicated.
    assert_eq!(submissions[0].alloc_ids, vec![1, 2, 3]);
}

#[test]
fn duplicate_identities_within_one_operation_count_once() {
    let (device, ctx) = setup(2);

    ctx.append_fixed(opcode::NOP, &()).unwrap();
    // Three references, two identities: fits a two-slot table.
    ctx.track_for_op(&[binding(7), binding(7), binding(8)])
        .unwrap();
    ctx.submit(SubmitKind::Render).unwrap();

    let submissions = device.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].alloc_ids, vec![7, 8]);
}

#[test]
fn flush_with_only_tracked_allocations_still_submits_the_table() {
    let (device, ctx) = setup(2);

    // References tracked, no packets encoded yet: a flush must carry the
    // table rather than strand the identities.
    ctx.track_for_op(&[binding(1)]).unwrap();
    ctx.flush().unwrap();

    let submissions = device.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].alloc_ids, vec![1]);
    assert!(submissions[0].opcodes.is_empty());
}

#[test]
fn tables_reset_between_submissions() {
    let (device, ctx) = setup(2);

    ctx.append_fixed(opcode::NOP, &()).unwrap();
    ctx.track_for_op(&[binding(1), binding(2)]).unwrap();
    ctx.submit(SubmitKind::Render).unwrap();

    ctx.append_fixed(opcode::NOP, &()).unwrap();
    ctx.track_for_op(&[binding(3)]).unwrap();
    ctx.submit(SubmitKind::Render).unwrap();

    let submissions = device.submissions();
    assert_eq!(submissions[0].alloc_ids, vec![1, 2]);
    assert_eq!(submissions[1].alloc_ids, vec![3]);
}
