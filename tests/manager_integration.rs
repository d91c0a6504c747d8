//! End-to-end scenarios (component K, SPEC_FULL §8) driving a real
//! reactor over a real Unix-domain socket. Tests construct a `Reactor`
//! directly rather than going through `Manager::run`: the facade's only
//! extra behavior is installing the *process-wide* logger and SIGINT/
//! SIGTERM handlers, which would fight across tests running in the same
//! process; the reactor, registry, session and link code under test is
//! identical either way.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
use nix::sys::stat::fstat;

use smb_manager::auth::PermittedCredentials;
use smb_manager::link::Listener;
use smb_manager::reactor::Reactor;
use smb_manager::registry::Registry;
use smb_manager::wire::{self, Response};

const DEFAULT_BUFFER_SIZE: u64 = 64 * 1024;

struct TestManager {
    socket_path: PathBuf,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TestManager {
    fn start(vlan: &str, permitted: PermittedCredentials) -> TestManager {
        let socket_path = PathBuf::from("/tmp/smb_manager")
            .join(format!("{vlan}-{}", std::process::id()))
            .join("manager.sock");

        let listener = Listener::bind(&socket_path).expect("bind listener");
        let mut reactor = Reactor::new(listener).expect("construct reactor");
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_in_thread = Arc::clone(&shutdown);

        let handle = thread::spawn(move || {
            let mut registry = Registry::new();
            reactor
                .run(
                    DEFAULT_BUFFER_SIZE,
                    &permitted,
                    &mut registry,
                    &shutdown_in_thread,
                )
                .expect("reactor run");
        });

        // Give the listener a moment to be poll-registered before the
        // first client connects.
        thread::sleep(Duration::from_millis(20));

        TestManager {
            socket_path,
            shutdown,
            handle: Some(handle),
        }
    }

    fn connect(&self) -> UnixStream {
        UnixStream::connect(&self.socket_path).expect("connect to manager")
    }
}

impl Drop for TestManager {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn default_permitted() -> PermittedCredentials {
    PermittedCredentials {
        uids: HashSet::from([current_uid()]),
        gids: HashSet::new(),
    }
}

fn current_uid() -> u32 {
    nix::unistd::geteuid().as_raw()
}

fn send(stream: &mut UnixStream, bytes: &[u8]) {
    stream.write_all(bytes).expect("send request");
}

fn recv_response(stream: &mut UnixStream) -> Response {
    let mut buf = [0u8; wire::MAX_MESSAGE_SIZE];
    let n = stream.read(&mut buf).expect("read response");
    wire::decode_response(&buf[..n]).expect("decode response")
}

fn recv_fd(stream: &UnixStream) -> RawFd {
    let mut data = [0u8; 1];
    let mut iov = [std::io::IoSliceMut::new(&mut data)];
    let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);
    let msg = recvmsg::<()>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_space),
        MsgFlags::empty(),
    )
    .expect("recvmsg for fd transfer");
    for cmsg in msg.cmsgs().expect("parse cmsgs") {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            return fds[0];
        }
    }
    panic!("no fd in ancillary data");
}

fn fd_inode(fd: RawFd) -> u64 {
    // SAFETY: `fd` is a valid, open descriptor for the duration of this call.
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    fstat(&borrowed).expect("fstat").st_ino
}

#[test]
fn scenario_1_basic_rendezvous() {
    let manager = TestManager::start("scenario1", default_permitted());

    let mut writer = manager.connect();
    send(&mut writer, &wire::encode_writer_subscribe_request(0, b"trades"));
    assert_eq!(recv_response(&mut writer), Response::Approval);
    let writer_fd = recv_fd(&writer);

    let mut reader = manager.connect();
    send(&mut reader, &wire::encode_reader_subscribe_request(0, b"trades"));
    assert_eq!(recv_response(&mut reader), Response::Approval);
    let reader_fd = recv_fd(&reader);

    assert_eq!(fd_inode(writer_fd), fd_inode(reader_fd));
}

#[test]
fn scenario_2_event_delivery() {
    let manager = TestManager::start("scenario2", default_permitted());

    let mut writer = manager.connect();
    send(&mut writer, &wire::encode_event_mode_request());
    assert_eq!(recv_response(&mut writer), Response::Approval);

    send(&mut writer, &wire::encode_writer_subscribe_request(0, b"x"));
    assert_eq!(recv_response(&mut writer), Response::Approval);
    recv_fd(&writer);

    let mut reader1 = manager.connect();
    send(&mut reader1, &wire::encode_reader_subscribe_request(0, b"x"));
    assert_eq!(recv_response(&mut reader1), Response::Approval);
    recv_fd(&reader1);
    assert_eq!(
        recv_response(&mut writer),
        Response::ChannelSubscriptionEvent {
            num_readers: 1,
            channel_name: b"x".to_vec(),
        }
    );

    let mut reader2 = manager.connect();
    send(&mut reader2, &wire::encode_reader_subscribe_request(0, b"x"));
    assert_eq!(recv_response(&mut reader2), Response::Approval);
    recv_fd(&reader2);
    assert_eq!(
        recv_response(&mut writer),
        Response::ChannelSubscriptionEvent {
            num_readers: 2,
            channel_name: b"x".to_vec(),
        }
    );

    send(&mut reader1, &wire::encode_reader_unsubscribe_request(b"x"));
    assert_eq!(recv_response(&mut reader1), Response::Approval);
    assert_eq!(
        recv_response(&mut writer),
        Response::ChannelSubscriptionEvent {
            num_readers: 1,
            channel_name: b"x".to_vec(),
        }
    );
}

#[test]
fn scenario_3_second_writer_denial() {
    let manager = TestManager::start("scenario3", default_permitted());

    let mut w1 = manager.connect();
    send(&mut w1, &wire::encode_writer_subscribe_request(0, b"only"));
    assert_eq!(recv_response(&mut w1), Response::Approval);
    recv_fd(&w1);

    let mut w2 = manager.connect();
    send(&mut w2, &wire::encode_writer_subscribe_request(0, b"only"));
    assert_eq!(recv_response(&mut w2), Response::Denial);
}

#[test]
fn scenario_4_disconnect_cleanup() {
    let manager = TestManager::start("scenario4", default_permitted());

    let mut writer = manager.connect();
    send(&mut writer, &wire::encode_writer_subscribe_request(0, b"a"));
    assert_eq!(recv_response(&mut writer), Response::Approval);
    let first_fd = recv_fd(&writer);
    let first_inode = fd_inode(first_fd);

    let mut reader1 = manager.connect();
    send(&mut reader1, &wire::encode_reader_subscribe_request(0, b"a"));
    assert_eq!(recv_response(&mut reader1), Response::Approval);
    recv_fd(&reader1);

    drop(writer);
    thread::sleep(Duration::from_millis(50));

    // Channel "a" still exists: a fresh reader subscribe is approved
    // against the very same buffer.
    let mut reader2 = manager.connect();
    send(&mut reader2, &wire::encode_reader_subscribe_request(0, b"a"));
    assert_eq!(recv_response(&mut reader2), Response::Approval);
    let still_same_fd = recv_fd(&reader2);
    assert_eq!(fd_inode(still_same_fd), first_inode);

    send(&mut reader1, &wire::encode_reader_unsubscribe_request(b"a"));
    assert_eq!(recv_response(&mut reader1), Response::Approval);
    send(&mut reader2, &wire::encode_reader_unsubscribe_request(b"a"));
    assert_eq!(recv_response(&mut reader2), Response::Approval);

    // Channel destroyed: a brand new writer subscribe gets a distinct buffer.
    let mut writer2 = manager.connect();
    send(&mut writer2, &wire::encode_writer_subscribe_request(0, b"a"));
    assert_eq!(recv_response(&mut writer2), Response::Approval);
    let new_fd = recv_fd(&writer2);
    assert_ne!(fd_inode(new_fd), first_inode);
}

#[test]
fn scenario_5_admission_failure() {
    let restrictive = PermittedCredentials {
        uids: HashSet::from([current_uid() + 1]),
        gids: HashSet::new(),
    };
    let manager = TestManager::start("scenario5", restrictive);

    let mut client = manager.connect();
    send(&mut client, &wire::encode_event_mode_request());

    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).expect("read after rejected admission");
    assert_eq!(n, 0, "rejected client should see EOF, not a reply");
}

#[test]
fn scenario_6_protocol_violation() {
    let manager = TestManager::start("scenario6", default_permitted());

    let mut client = manager.connect();
    // Header claims size=200 but only 64 bytes are actually written.
    let mut bogus = vec![0u8; 64];
    bogus[0] = wire::VERSION;
    bogus[1] = wire::message_type::EVENT_MODE_REQUEST;
    bogus[2..4].copy_from_slice(&200u16.to_ne_bytes());
    client.write_all(&bogus).expect("send bogus frame");

    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).expect("read after protocol violation");
    assert_eq!(n, 0, "protocol violation should disconnect without a reply");
}
