//! IPC rendezvous tests
//!
//! Client and server live in separate protection domains and only meet
//! through capabilities the core domain mapped for them.

use nocturne_kernel::ipc::{Message, Receive};
use nocturne_kernel::sched::ThreadState;
use nocturne_kernel::syscall::SyscallError;
use nocturne_kernel::{
    Badge, CapId, CpuId, EntryCause, Kernel, KernelConfig, ObjectId, ProtocolViolation, Rights,
};

struct World {
    kernel: Kernel,
    core: ObjectId,
    server: ObjectId,
    server_cap: CapId,
    client: ObjectId,
    client_pd: ObjectId,
    /// The client's capability to call the server
    call_cap: CapId,
    /// A receiver the client may pass along
    receiver_cap: CapId,
}

fn world() -> World {
    let mut kernel = Kernel::new(KernelConfig {
        cpus: 1,
        max_objects: 64,
        ..KernelConfig::default()
    })
    .unwrap();
    let core = kernel.core_thread();
    let faults = kernel.new_signal_receiver(core).unwrap();
    let faults = kernel.new_signal_context(core, faults, 0).unwrap();

    let spawn = |kernel: &mut Kernel| {
        let pd_cap = kernel.create_pd(core).unwrap();
        let thread_cap = kernel.new_thread(core, pd_cap, 1, 0, faults).unwrap();
        kernel
            .start_thread(core, thread_cap, CpuId::BOOT, 0x1000, 0)
            .unwrap();
        (pd_cap, thread_cap)
    };
    let (_, server_cap) = spawn(&mut kernel);
    let (client_pd_cap, client_cap) = spawn(&mut kernel);

    let core_pd = kernel.core_pd();
    let server = kernel.lookup(core_pd, server_cap).unwrap().object;
    let client = kernel.lookup(core_pd, client_cap).unwrap().object;
    let client_pd = kernel.lookup(core_pd, client_pd_cap).unwrap().object;

    let call_cap = kernel
        .map_cap(core, server_cap, client_pd_cap, Rights::CALL, Badge(0xbeef))
        .unwrap();
    let receiver = kernel.new_signal_receiver(core).unwrap();
    let receiver_cap = kernel
        .map_cap(core, receiver, client_pd_cap, Rights::WAIT | Rights::GRANT, Badge::NONE)
        .unwrap();

    World {
        kernel,
        core,
        server,
        server_cap,
        client,
        client_pd,
        call_cap,
        receiver_cap,
    }
}

#[test]
fn test_request_reply_round_trip() {
    let World {
        mut kernel,
        server,
        client,
        call_cap,
        ..
    } = world();

    assert_eq!(kernel.wait(server), Ok(Receive::Blocked));
    kernel
        .call(client, call_cap, Message::with_words(7, &[10, 20]))
        .unwrap();

    let s = kernel.thread(server).unwrap();
    assert_eq!(s.state(), ThreadState::Active);
    assert_eq!(s.utcb().tag(), 7);
    assert_eq!(s.utcb().words(), &[10, 20]);
    assert_eq!(s.utcb().badge(), Badge(0xbeef));
    assert_eq!(s.regs().result(), 0);
    assert_eq!(kernel.thread(client).unwrap().state(), ThreadState::AwaitsIpc);

    kernel.reply(server, Message::with_words(0, &[30])).unwrap();
    let c = kernel.thread(client).unwrap();
    assert_eq!(c.state(), ThreadState::Active);
    assert_eq!(c.utcb().words(), &[30]);
    assert_eq!(c.regs().result(), 0);
    assert_eq!(kernel.check_invariants(), Ok(()));
}

#[test]
fn test_reply_and_wait_serves_queue() {
    let World {
        mut kernel,
        server,
        client,
        call_cap,
        ..
    } = world();

    // Server is busy; the request queues.
    kernel.call(client, call_cap, Message::with_words(1, &[1])).unwrap();
    assert_eq!(kernel.wait(server), Ok(Receive::Delivered));
    assert_eq!(
        kernel.wait(server),
        Err(ProtocolViolation::ReplyPending.into())
    );

    assert_eq!(
        kernel.reply_and_wait(server, Message::new(0)),
        Ok(Receive::Blocked)
    );
    assert_eq!(kernel.thread(client).unwrap().state(), ThreadState::Active);
    assert_eq!(kernel.thread(server).unwrap().state(), ThreadState::AwaitsIpc);
    assert_eq!(kernel.check_invariants(), Ok(()));
}

#[test]
fn test_capability_transfer() {
    let World {
        mut kernel,
        server,
        client,
        call_cap,
        receiver_cap,
        ..
    } = world();

    let mut msg = Message::new(2);
    msg.push_cap(receiver_cap).unwrap();
    msg.push_cap(CapId(4000)).unwrap();
    kernel.wait(server).unwrap();
    kernel.call(client, call_cap, msg).unwrap();

    let caps = kernel.thread(server).unwrap().utcb().caps().to_vec();
    assert_eq!(caps.len(), 2);
    assert_ne!(caps[0], CapId::NONE);
    assert_eq!(caps[1], CapId::NONE);

    let server_pd = kernel.thread(server).unwrap().pd();
    let entry = kernel.lookup(server_pd, caps[0]).unwrap();
    assert_eq!(entry.rights, Rights::WAIT | Rights::GRANT);
    assert_eq!(kernel.check_invariants(), Ok(()));
}

#[test]
fn test_server_death_fails_clients() {
    let World {
        mut kernel,
        core,
        server_cap,
        client,
        call_cap,
        ..
    } = world();

    kernel.call(client, call_cap, Message::new(0)).unwrap();
    kernel.kill_thread(core, server_cap).unwrap();

    let c = kernel.thread(client).unwrap();
    assert_eq!(c.state(), ThreadState::Active);
    assert_eq!(c.regs().result(), SyscallError::PeerDestroyed as i64);

    // Destroying the server revoked the client's entry as well.
    assert_eq!(
        kernel.call(client, call_cap, Message::new(0)),
        Err(nocturne_kernel::KernelError::InvalidCapability(call_cap))
    );
    assert_eq!(kernel.check_invariants(), Ok(()));
}

#[test]
fn test_client_domain_death_loses_reply() {
    let World {
        mut kernel,
        core,
        server,
        client,
        client_pd,
        call_cap,
        ..
    } = world();

    kernel.wait(server).unwrap();
    kernel.call(client, call_cap, Message::new(0)).unwrap();

    let client_pd_cap = kernel
        .objects()
        .get(client_pd)
        .unwrap()
        .links()
        .iter()
        .find(|(pd, _)| *pd == kernel.core_pd())
        .map(|&(_, cap)| cap)
        .unwrap();
    kernel.kill_pd(core, client_pd_cap).unwrap();

    assert_eq!(
        kernel.reply(server, Message::new(0)),
        Err(nocturne_kernel::KernelError::PeerDestroyed)
    );
    assert_eq!(kernel.check_invariants(), Ok(()));
}

#[test]
fn test_waiting_server_leaves_round_robin() {
    let World {
        mut kernel,
        core,
        server,
        client,
        ..
    } = world();

    kernel.wait(server).unwrap();
    let fill = kernel.config().fill_slice;
    assert_eq!(kernel.enter(CpuId::BOOT, 0, EntryCause::Timer).thread, Some(core));
    assert_eq!(kernel.enter(CpuId::BOOT, fill, EntryCause::Timer).thread, Some(client));
    assert_eq!(kernel.enter(CpuId::BOOT, fill, EntryCause::Timer).thread, Some(core));
}
