// SPDX-License-Identifier: BSD-3-Clause

use clap::{Parser, Subcommand};
use log::info;

use binder_core::BinderDevice;

#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    scenario: Scenario,
}

#[derive(Subcommand)]
enum Scenario {
    /// Registers a context manager, sends one transaction through it, and
    /// prints the reply (spec scenario S1).
    Hello,
    /// Sends a transaction carrying a Binder-typed descriptor and shows the
    /// receiver picking up a handle to it (spec scenario S2).
    Forward,
    /// Registers a death notification, tears the owning process down, and
    /// shows the watcher receiving `BR_DEAD_BINDER` (spec scenario S4).
    Death,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match cli.scenario {
        Scenario::Hello => run_hello(),
        Scenario::Forward => run_forward(),
        Scenario::Death => run_death(),
    }
}

fn pad8(n: usize) -> usize {
    (n + 7) & !7
}

/// Encodes a transaction with no embedded flat objects: the data region is
/// padded to 8 bytes on its own, and the (empty) offsets region contributes
/// nothing, matching how `BcReader` walks the record.
fn encode_transaction(bcmd: u32, target: u64, code: u32, flags: u32, data: &[u8]) -> Vec<u8> {
    let data_size = data.len();
    let mut out = Vec::new();
    out.extend_from_slice(&bcmd.to_le_bytes());
    out.extend_from_slice(&target.to_le_bytes());
    out.extend_from_slice(&code.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&(data_size as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(data);
    out.resize(out.len() + (pad8(data_size) - data_size), 0);
    out
}

fn describe_first_command(read: &[u8]) -> &'static str {
    if read.is_empty() {
        return "(nothing)";
    }
    match u32::from_le_bytes(read[0..4].try_into().unwrap()) {
        1 => "BR_TRANSACTION",
        2 => "BR_REPLY",
        3 => "BR_TRANSACTION_COMPLETE",
        4 => "BR_FAILED_REPLY",
        5 => "BR_DEAD_REPLY",
        6 => "BR_DEAD_BINDER",
        7 => "BR_CLEAR_DEATH_NOTIFICATION_DONE",
        8 => "BR_SPAWN_LOOPER",
        _ => "(unrecognized)",
    }
}

fn run_hello() {
    let device = BinderDevice::new();
    let server = device.open(1, 0, true);
    let client = device.open(2, 0, true);

    device.set_context_mgr(&server, 0xC0FFEE, 0).unwrap();
    info!("server {} registered as context manager", server.pid);

    let enter = 5u32.to_le_bytes().to_vec(); // BC_ENTER_LOOPER
    device.write_read(&server, 100, &enter, 0).unwrap();

    let bc = encode_transaction(1, 0, 42, 0, b"hello server");
    let sent = device.write_read(&client, 200, &bc, 4096).unwrap();
    info!("client got: {}", describe_first_command(&sent.read));

    let got = device.write_read(&server, 100, &[], 4096).unwrap();
    info!("server got: {}", describe_first_command(&got.read));

    let reply = encode_transaction(2, 0, 0, 0, b"hello client");
    device.write_read(&server, 100, &reply, 4096).unwrap();

    let final_read = device.write_read(&client, 200, &[], 4096).unwrap();
    info!("client got: {}", describe_first_command(&final_read.read));
}

fn run_forward() {
    let device = BinderDevice::new();
    let owner = device.open(1, 0, true);
    let client = device.open(2, 0, true);

    device.set_context_mgr(&owner, 0, 0).unwrap();

    let mut data = vec![0u8; 24];
    data[0..4].copy_from_slice(&1u32.to_le_bytes()); // FlatObjectType::Binder
    data[8..16].copy_from_slice(&0x1234u64.to_le_bytes()); // binder ptr
    data[16..24].copy_from_slice(&0x5678u64.to_le_bytes()); // cookie

    let data_size = data.len();
    let offsets_size = 4usize;

    let mut bc = Vec::new();
    bc.extend_from_slice(&1u32.to_le_bytes()); // BC_TRANSACTION
    bc.extend_from_slice(&0u64.to_le_bytes()); // target: context manager
    bc.extend_from_slice(&7u32.to_le_bytes()); // code
    bc.extend_from_slice(&0u32.to_le_bytes()); // flags
    bc.extend_from_slice(&(data_size as u32).to_le_bytes());
    bc.extend_from_slice(&(offsets_size as u32).to_le_bytes());
    bc.extend_from_slice(&data);
    bc.resize(bc.len() + (pad8(data_size) - data_size), 0);
    bc.extend_from_slice(&0u32.to_le_bytes()); // offsets[0] = 0
    bc.resize(bc.len() + (pad8(offsets_size) - offsets_size), 0);

    device.write_read(&client, 200, &bc, 4096).unwrap();
    let got = device.write_read(&owner, 100, &[], 4096).unwrap();
    info!(
        "owner received forwarded object, command: {}",
        describe_first_command(&got.read)
    );
}

fn run_death() {
    let device = BinderDevice::new();
    let owner = device.open(1, 0, true);
    let watcher = device.open(2, 0, true);

    owner.objects.intern_local(0x9);
    owner
        .objects
        .find_local(0x9)
        .unwrap()
        .set_real_cookie_if_absent(0x9);
    let handle_record = watcher.objects.intern(owner.queue.id(), 0x9);
    let handle = handle_record.handle().unwrap();

    let mut bc = Vec::new();
    bc.extend_from_slice(&3u32.to_le_bytes()); // BC_REQUEST_DEATH_NOTIFICATION
    bc.extend_from_slice(&(handle as u64).to_le_bytes());
    bc.extend_from_slice(&0xD1u64.to_le_bytes());
    device.write_read(&watcher, 1, &bc, 64).unwrap();

    info!("owner {} tearing down", owner.pid);
    device.release(&owner);

    let result = device.write_read(&watcher, 1, &[], 64).unwrap();
    info!("watcher got: {}", describe_first_command(&result.read));
}
