// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End to end tests of the HGCM request pipeline: guest requests go in through
//! the VMMDev front end, a scripted connector plays the host services.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;
use vm_memory::GuestAddress;
use vm_memory::GuestPhysMemory;
use vm_memory::VecGuestMemory;
use vmmdev::protocol::CtlGuestFilterMask;
use vmmdev::protocol::Events;
use vmmdev::protocol::HgcmCall;
use vmmdev::protocol::HgcmCancel2;
use vmmdev::protocol::HgcmConnect;
use vmmdev::protocol::HgcmDisconnect;
use vmmdev::protocol::HgcmRequestHeader;
use vmmdev::protocol::ParmType;
use vmmdev::protocol::RequestHeader;
use vmmdev::protocol::RequestType;
use vmmdev::protocol::ServiceLocation;
use vmmdev::protocol::VBOX_HGCM_F_PARM_DIRECTION_FROM_HOST;
use vmmdev::protocol::VBOX_HGCM_REQ_DONE;
use vmmdev::protocol::VMMDEV_EVENT_HGCM;
use vmmdev::protocol::VMMDEV_HGCM_LOC_LOCALHOST;
use vmmdev::protocol::VMMDEV_HGCM_LOC_LOCALHOST_EXISTING;
use vmmdev::protocol::VMMDEV_REQUEST_HEADER_VERSION;
use vmmdev::saved_state::SavedStateError;
use vmmdev::HeapCategory;
use vmmdev::HgcmCommand;
use vmmdev::HgcmConnector;
use vmmdev::HgcmPort;
use vmmdev::HostParm;
use vmmdev::IrqLine;
use vmmdev::Status;
use vmmdev::Suspendable;
use vmmdev::Vmmdev;
use vmmdev::VmmdevConfig;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

const BUDGET: u64 = 1 << 20;
const REQ: u64 = 0x1000;
const CANCEL_REQ: u64 = 0x3000;
const DATA_PHYS: u64 = 0x8000;
const OTHER_PHYS: u64 = 0xa000;
const DATA_LINEAR: u64 = 0x40_0000;

#[derive(Default)]
struct TestIrq {
    level: AtomicBool,
}

impl IrqLine for TestIrq {
    fn set_level(&self, asserted: bool) {
        self.level.store(asserted, Ordering::SeqCst);
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Seen {
    Connect(Vec<u8>),
    Disconnect(u32),
    Call {
        client_id: u32,
        function: u32,
        restored: bool,
    },
    Cancelled(u32),
}

/// Records every request and keeps the commands until the test completes
/// them.
struct FakeConnector {
    seen: Mutex<Vec<Seen>>,
    pending: Mutex<Vec<Arc<HgcmCommand>>>,
    call_status: Mutex<Status>,
}

impl FakeConnector {
    fn new() -> Arc<FakeConnector> {
        Arc::new(FakeConnector {
            seen: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            call_status: Mutex::new(Status::HGCM_ASYNC_EXECUTE),
        })
    }

    fn take_pending(&self) -> Vec<Arc<HgcmCommand>> {
        std::mem::take(&mut *self.pending.lock())
    }
}

impl HgcmConnector for FakeConnector {
    fn connect(&self, cmd: &Arc<HgcmCommand>, loc: &ServiceLocation) -> Status {
        self.seen.lock().push(Seen::Connect(loc.service_name().to_vec()));
        cmd.set_client_id(7);
        self.pending.lock().push(cmd.clone());
        Status::HGCM_ASYNC_EXECUTE
    }

    fn disconnect(&self, cmd: &Arc<HgcmCommand>, client_id: u32) -> Status {
        self.seen.lock().push(Seen::Disconnect(client_id));
        self.pending.lock().push(cmd.clone());
        Status::HGCM_ASYNC_EXECUTE
    }

    fn call(
        &self,
        cmd: &Arc<HgcmCommand>,
        client_id: u32,
        function: u32,
        _arrival: Instant,
    ) -> Status {
        self.seen.lock().push(Seen::Call {
            client_id,
            function,
            restored: cmd.is_restored(),
        });
        let status = *self.call_status.lock();
        if status == Status::HGCM_ASYNC_EXECUTE {
            self.pending.lock().push(cmd.clone());
        }
        status
    }

    fn cancelled(&self, _cmd: &Arc<HgcmCommand>, client_id: u32) {
        self.seen.lock().push(Seen::Cancelled(client_id));
    }
}

struct Env {
    mem: Arc<VecGuestMemory>,
    irq: Arc<TestIrq>,
    dev: Vmmdev,
    connector: Arc<FakeConnector>,
    port: Arc<HgcmPort>,
}

fn config(budget: u64) -> VmmdevConfig {
    VmmdevConfig {
        heap_budget_default: Some(budget),
        ..Default::default()
    }
}

impl Env {
    fn new() -> Env {
        let mem = Arc::new(VecGuestMemory::new(&[(GuestAddress(0), 0x10_0000)]));
        Env::with_memory(mem, config(BUDGET))
    }

    fn with_memory(mem: Arc<VecGuestMemory>, config: VmmdevConfig) -> Env {
        let _ = env_logger::builder().is_test(true).try_init();
        let irq = Arc::new(TestIrq::default());
        let dev = Vmmdev::new(mem.clone(), irq.clone(), config);
        let connector = FakeConnector::new();
        dev.attach_hgcm_connector(connector.clone());
        dev.set_additions_ok(true);
        let port = dev.hgcm_port();
        Env {
            mem,
            irq,
            dev,
            connector,
            port,
        }
    }

    fn submit(&self, addr: u64, req: &[u8]) {
        self.mem.write_all_at_addr(req, GuestAddress(addr)).unwrap();
        self.dev.handle_request(GuestAddress(addr));
    }

    fn header(&self, addr: u64) -> HgcmRequestHeader {
        let mut hdr = HgcmRequestHeader::new_zeroed();
        self.mem
            .read_exact_at_addr(hdr.as_mut_bytes(), GuestAddress(addr))
            .unwrap();
        hdr
    }

    fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.mem
            .read_exact_at_addr(&mut buf, GuestAddress(addr))
            .unwrap();
        buf
    }
}

fn request_header(size: usize, request_type: RequestType) -> RequestHeader {
    RequestHeader {
        size: size as u32,
        version: VMMDEV_REQUEST_HEADER_VERSION,
        request_type: request_type as u32,
        ..Default::default()
    }
}

fn hgcm_header(size: usize, request_type: RequestType) -> HgcmRequestHeader {
    HgcmRequestHeader {
        header: request_header(size, request_type),
        flags: 0,
        result: 0,
    }
}

fn value32(v: u32) -> (ParmType, Vec<u8>) {
    (ParmType::Value32, v.to_le_bytes().to_vec())
}

fn value64(v: u64) -> (ParmType, Vec<u8>) {
    (ParmType::Value64, v.to_le_bytes().to_vec())
}

fn linaddr32(parm_type: ParmType, size: u32, linear: u32) -> (ParmType, Vec<u8>) {
    let mut u = size.to_le_bytes().to_vec();
    u.extend_from_slice(&linear.to_le_bytes());
    (parm_type, u)
}

fn call_request(
    request_type: RequestType,
    client_id: u32,
    function: u32,
    parms: &[(ParmType, Vec<u8>)],
) -> Vec<u8> {
    let union_size = if request_type == RequestType::HgcmCall64 { 12 } else { 8 };
    let size = std::mem::size_of::<HgcmCall>() + parms.len() * (4 + union_size);
    let call = HgcmCall {
        header: hgcm_header(size, request_type),
        client_id,
        function,
        parm_count: parms.len() as u32,
    };
    let mut req = call.as_bytes().to_vec();
    for (parm_type, u) in parms {
        req.extend_from_slice(&(*parm_type as u32).to_le_bytes());
        let mut union = vec![0u8; union_size];
        union[..u.len()].copy_from_slice(u);
        req.extend_from_slice(&union);
    }
    req
}

fn connect_request(location_type: u32, name: &str) -> Vec<u8> {
    let mut connect = HgcmConnect::new_zeroed();
    connect.header = hgcm_header(std::mem::size_of::<HgcmConnect>(), RequestType::HgcmConnect);
    connect.loc.location_type = location_type;
    connect.loc.name[..name.len()].copy_from_slice(name.as_bytes());
    connect.as_bytes().to_vec()
}

fn disconnect_request(client_id: u32) -> Vec<u8> {
    HgcmDisconnect {
        header: hgcm_header(
            std::mem::size_of::<HgcmDisconnect>(),
            RequestType::HgcmDisconnect,
        ),
        client_id,
    }
    .as_bytes()
    .to_vec()
}

fn cancel2_request(target: u32) -> Vec<u8> {
    HgcmCancel2 {
        header: request_header(std::mem::size_of::<HgcmCancel2>(), RequestType::HgcmCancel2),
        phys_req_to_cancel: target,
    }
    .as_bytes()
    .to_vec()
}

fn page_list32(parm_type: ParmType, size: u32, info_off: u32) -> (ParmType, Vec<u8>) {
    let mut u = size.to_le_bytes().to_vec();
    u.extend_from_slice(&info_off.to_le_bytes());
    (parm_type, u)
}

fn embedded(flags: u32, data_off: u32, size: u32) -> (ParmType, Vec<u8>) {
    let mut u = ((data_off << 8) | flags).to_le_bytes().to_vec();
    u.extend_from_slice(&size.to_le_bytes());
    (ParmType::Embedded, u)
}

/// Appends `extra` to the request and fixes up its size.
fn with_extra(mut req: Vec<u8>, extra: &[u8]) -> Vec<u8> {
    req.extend_from_slice(extra);
    let size = req.len() as u32;
    req[..4].copy_from_slice(&size.to_le_bytes());
    req
}

/// Polls until the request at `addr` is marked done.
fn wait_done(env: &Env, addr: u64) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if env.header(addr).flags & VBOX_HGCM_REQ_DONE != 0 {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Submits a call with a 32-bit value and a 4 byte output buffer.
fn submit_value_and_out_call(env: &Env) -> Arc<HgcmCommand> {
    env.mem
        .map_linear(DATA_LINEAR, GuestAddress(DATA_PHYS), 4096);
    let req = call_request(
        RequestType::HgcmCall32,
        1,
        5,
        &[
            value32(42),
            linaddr32(ParmType::LinAddrOut, 4, DATA_LINEAR as u32),
        ],
    );
    env.submit(REQ, &req);
    let mut pending = env.connector.take_pending();
    assert_eq!(pending.len(), 1);
    pending.remove(0)
}

#[test]
fn call_completes_into_guest_buffer() {
    let env = Env::new();
    let cmd = submit_value_and_out_call(&env);

    // Accepted: only the rc was touched.
    let hdr = env.header(REQ);
    assert_eq!(hdr.header.rc, Status::HGCM_ASYNC_EXECUTE.0);
    assert_eq!(hdr.flags & VBOX_HGCM_REQ_DONE, 0);
    assert_eq!(
        *env.connector.seen.lock(),
        vec![Seen::Call {
            client_id: 1,
            function: 5,
            restored: false
        }]
    );
    assert_eq!(env.dev.pending_hgcm_commands(), 1);
    assert_eq!(env.mem.locked_page_count(), 1);

    {
        let mut parms = cmd.host_parms();
        assert_eq!(parms.len(), 2);
        assert!(matches!(parms[0], HostParm::U32(42)));
        match &mut parms[1] {
            HostParm::Buffer(buf) => {
                assert_eq!(buf.size, 4);
                buf.data.copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
            }
            other => panic!("unexpected host parameter {:?}", other),
        }
    }
    assert_eq!(env.port.completed(&cmd, Status::SUCCESS), Status::SUCCESS);
    env.dev.process_completions();

    assert_eq!(env.read(DATA_PHYS, 4), vec![0xEF, 0xBE, 0xAD, 0xDE]);
    let hdr = env.header(REQ);
    assert_eq!(hdr.result, Status::SUCCESS.0);
    assert_ne!(hdr.flags & VBOX_HGCM_REQ_DONE, 0);
    assert!(env.irq.level.load(Ordering::SeqCst));
    assert_eq!(env.dev.fast_ack_events(), VMMDEV_EVENT_HGCM);
    assert!(!env.irq.level.load(Ordering::SeqCst));

    assert_eq!(env.dev.pending_hgcm_commands(), 0);
    assert_eq!(env.mem.locked_page_count(), 0);
    assert_eq!(env.dev.heap_available(HeapCategory::Kernel), BUDGET);
    assert_eq!(env.dev.stats().hgcm.completed, 1);
}

#[test]
fn completion_from_service_thread_reaches_guest() {
    let env = Env::new();
    let cmd = submit_value_and_out_call(&env);
    let port = env.port.clone();
    let service = thread::spawn(move || {
        if let HostParm::Buffer(buf) = &mut cmd.host_parms()[1] {
            buf.data.copy_from_slice(&[1, 2, 3, 4]);
        }
        port.completed(&cmd, Status::SUCCESS)
    });
    assert_eq!(service.join().unwrap(), Status::SUCCESS);

    // No further guest request arrives; the device applies it on its own.
    assert!(wait_done(&env, REQ));
    assert_eq!(env.dev.heap_available(HeapCategory::Kernel), BUDGET);
    assert!(env.irq.level.load(Ordering::SeqCst));
    assert_eq!(env.header(REQ).result, Status::SUCCESS.0);
    assert_eq!(env.read(DATA_PHYS, 4), vec![1, 2, 3, 4]);
    assert_eq!(env.dev.pending_hgcm_commands(), 0);
    assert_eq!(env.mem.locked_page_count(), 0);
}

#[test]
fn completions_wait_while_asleep() {
    let mut env = Env::new();
    let cmd = submit_value_and_out_call(&env);
    env.dev.sleep().unwrap();
    env.port.completed(&cmd, Status::SUCCESS);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(env.header(REQ).flags & VBOX_HGCM_REQ_DONE, 0);
    assert_eq!(env.dev.pending_hgcm_commands(), 1);

    env.dev.wake().unwrap();
    assert!(wait_done(&env, REQ));
    assert_eq!(env.dev.heap_available(HeapCategory::Kernel), BUDGET);
    assert_eq!(env.dev.pending_hgcm_commands(), 0);
}

#[test]
fn call_type_changed_in_flight_fails() {
    let env = Env::new();
    let cmd = submit_value_and_out_call(&env);
    env.mem
        .write_all_at_addr(
            &(RequestType::HgcmConnect as u32).to_le_bytes(),
            GuestAddress(REQ + 8),
        )
        .unwrap();
    if let HostParm::Buffer(buf) = &mut cmd.host_parms()[1] {
        buf.data.fill(0xff);
    }
    env.port.completed(&cmd, Status::SUCCESS);
    env.dev.process_completions();

    let hdr = env.header(REQ);
    assert_eq!(hdr.result, Status::INVALID_PARAMETER.0);
    assert_ne!(hdr.flags & VBOX_HGCM_REQ_DONE, 0);
    assert_eq!(env.read(DATA_PHYS, 4), vec![0; 4]);
    assert_eq!(env.dev.pending_hgcm_commands(), 0);
}

#[test]
fn no_bounce_page_list_written_in_place() {
    let env = Env::new();
    // One parameter record, then the page list info and its page.
    let info_off = std::mem::size_of::<HgcmCall>() as u32 + 12;
    let mut info = VBOX_HGCM_F_PARM_DIRECTION_FROM_HOST.to_le_bytes().to_vec();
    info.extend_from_slice(&0u16.to_le_bytes());
    info.extend_from_slice(&1u16.to_le_bytes());
    info.extend_from_slice(&DATA_PHYS.to_le_bytes());
    let req = with_extra(
        call_request(
            RequestType::HgcmCall32,
            1,
            6,
            &[page_list32(ParmType::NoBouncePageList, 4, info_off)],
        ),
        &info,
    );
    env.submit(REQ, &req);
    assert_eq!(env.header(REQ).header.rc, Status::HGCM_ASYNC_EXECUTE.0);
    // The request page and the data page.
    assert_eq!(env.mem.locked_page_count(), 2);

    let cmd = env.connector.take_pending().remove(0);
    match &mut cmd.host_parms()[0] {
        HostParm::Pages(pages) => {
            assert!(pages.is_mapped());
            pages.write(0, &[1, 2, 3, 4]).unwrap();
            pages.size = 3;
        }
        other => panic!("unexpected host parameter {:?}", other),
    }
    env.port.completed(&cmd, Status::SUCCESS);
    env.dev.process_completions();

    assert_ne!(env.header(REQ).flags & VBOX_HGCM_REQ_DONE, 0);
    assert_eq!(env.read(DATA_PHYS, 4), vec![1, 2, 3, 4]);
    let size_off = std::mem::size_of::<HgcmCall>() as u64 + 4;
    assert_eq!(env.read(REQ + size_off, 4), 3u32.to_le_bytes().to_vec());
    assert_eq!(env.mem.locked_page_count(), 0);
}

#[test]
fn embedded_buffer_written_into_request() {
    let env = Env::new();
    let data_off = std::mem::size_of::<HgcmCall>() as u32 + 12;
    let req = with_extra(
        call_request(
            RequestType::HgcmCall32,
            1,
            7,
            &[embedded(VBOX_HGCM_F_PARM_DIRECTION_FROM_HOST, data_off, 8)],
        ),
        &[0xaa; 8],
    );
    env.submit(REQ, &req);
    let cmd = env.connector.take_pending().remove(0);
    match &mut cmd.host_parms()[0] {
        HostParm::Buffer(buf) => {
            // Out only: nothing was copied in.
            assert_eq!(buf.data, vec![0; 8]);
            buf.data[..3].copy_from_slice(&[7, 8, 9]);
            buf.size = 3;
        }
        other => panic!("unexpected host parameter {:?}", other),
    }
    env.port.completed(&cmd, Status::SUCCESS);
    env.dev.process_completions();

    assert_ne!(env.header(REQ).flags & VBOX_HGCM_REQ_DONE, 0);
    assert_eq!(env.read(REQ + data_off as u64, 8), vec![7, 8, 9, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa]);
    let size_off = std::mem::size_of::<HgcmCall>() as u64 + 8;
    assert_eq!(env.read(REQ + size_off, 4), 3u32.to_le_bytes().to_vec());
}

#[test]
fn synchronous_call_result_written_back() {
    let env = Env::new();
    *env.connector.call_status.lock() = Status::NOT_FOUND;
    let req = call_request(RequestType::HgcmCall64, 1, 2, &[value64(1)]);
    env.submit(REQ, &req);
    let hdr = env.header(REQ);
    assert_eq!(hdr.header.rc, Status::NOT_FOUND.0);
    assert_eq!(env.dev.pending_hgcm_commands(), 0);
    assert_eq!(env.mem.locked_page_count(), 0);
    assert_eq!(env.dev.heap_available(HeapCategory::Kernel), BUDGET);
}

#[test]
fn connect_reports_client_id() {
    let env = Env::new();
    env.submit(
        REQ,
        &connect_request(VMMDEV_HGCM_LOC_LOCALHOST_EXISTING, "VBoxSharedFolders"),
    );
    assert_eq!(*env.connector.seen.lock(), vec![Seen::Connect(b"VBoxSharedFolders".to_vec())]);
    let cmd = env.connector.take_pending().remove(0);
    env.port.completed(&cmd, Status::SUCCESS);
    env.dev.process_completions();
    let client_id = u32::from_le_bytes(env.read(REQ + 164, 4).try_into().unwrap());
    assert_eq!(client_id, 7);
    assert_ne!(env.header(REQ).flags & VBOX_HGCM_REQ_DONE, 0);
}

#[test]
fn connect_to_new_service_location_refused() {
    let env = Env::new();
    env.submit(REQ, &connect_request(VMMDEV_HGCM_LOC_LOCALHOST, "VBoxGuestPropSvc"));
    assert_eq!(env.header(REQ).header.rc, Status::INVALID_PARAMETER.0);
    assert!(env.connector.seen.lock().is_empty());
    assert_eq!(env.dev.pending_hgcm_commands(), 0);
}

#[test]
fn cancel_of_nil_address_rejected() {
    let env = Env::new();
    submit_value_and_out_call(&env);
    for target in [0, u32::MAX] {
        env.submit(CANCEL_REQ, &cancel2_request(target));
        assert_eq!(env.header(CANCEL_REQ).header.rc, Status::INVALID_PARAMETER.0);
    }
    assert_eq!(env.dev.pending_hgcm_commands(), 1);
    assert_eq!(env.connector.seen.lock().len(), 1);
}

#[test]
fn cancelled_call_leaves_guest_untouched() {
    let env = Env::new();
    let cmd = submit_value_and_out_call(&env);
    env.submit(CANCEL_REQ, &cancel2_request(REQ as u32));
    assert_eq!(env.header(CANCEL_REQ).header.rc, Status::SUCCESS.0);
    assert!(cmd.is_cancelled());
    assert_eq!(env.connector.seen.lock().last(), Some(&Seen::Cancelled(1)));

    if let HostParm::Buffer(buf) = &mut cmd.host_parms()[1] {
        buf.data.fill(0xff);
    }
    assert_eq!(env.port.completed(&cmd, Status::SUCCESS), Status::CANCELLED);
    env.dev.process_completions();

    assert_eq!(env.read(DATA_PHYS, 4), vec![0; 4]);
    assert_eq!(env.header(REQ).flags & VBOX_HGCM_REQ_DONE, 0);
    assert_eq!(env.dev.stats().hgcm.cancelled, 1);
    assert_eq!(env.dev.heap_available(HeapCategory::Kernel), BUDGET);

    // Gone after completion.
    env.submit(CANCEL_REQ, &cancel2_request(REQ as u32));
    assert_eq!(env.header(CANCEL_REQ).header.rc, Status::NOT_FOUND.0);
}

#[test]
fn completion_and_cancel_race_has_one_winner() {
    for _ in 0..20 {
        let env = Env::new();
        let cmd = submit_value_and_out_call(&env);
        let port = env.port.clone();
        let completer = thread::spawn(move || port.completed(&cmd, Status::SUCCESS));
        env.submit(CANCEL_REQ, &cancel2_request(REQ as u32));
        completer.join().unwrap();
        env.dev.process_completions();

        let done = env.header(REQ).flags & VBOX_HGCM_REQ_DONE != 0;
        let counters = env.dev.stats().hgcm;
        assert_eq!(counters.completed + counters.cancelled, 1);
        assert_eq!(done, counters.completed == 1);
        assert_eq!(env.dev.pending_hgcm_commands(), 0);
    }
}

#[test]
fn save_state_sentinel_keeps_command() {
    let env = Env::new();
    let cmd = submit_value_and_out_call(&env);
    env.port.completed(&cmd, Status::HGCM_SAVE_STATE);
    env.dev.process_completions();
    assert_eq!(env.dev.pending_hgcm_commands(), 1);
    assert_eq!(env.header(REQ).flags & VBOX_HGCM_REQ_DONE, 0);
}

#[test]
fn snapshot_restore_resubmits_call() {
    let env = Env::new();
    let req = call_request(
        RequestType::HgcmCall64,
        3,
        9,
        &[value64(0x1122_3344_5566_7788), value64(42)],
    );
    env.submit(REQ, &req);
    assert_eq!(env.connector.take_pending().len(), 1);
    let snapshot = env.dev.snapshot().unwrap();

    let mut restored = Env::with_memory(env.mem.clone(), config(BUDGET));
    restored.dev.restore(snapshot).unwrap();
    assert_eq!(
        *restored.connector.seen.lock(),
        vec![Seen::Call {
            client_id: 3,
            function: 9,
            restored: true
        }]
    );
    let mut pending = restored.connector.take_pending();
    assert_eq!(pending.len(), 1);
    let cmd = pending.remove(0);
    assert_eq!(cmd.client_id(), 3);
    assert_eq!(cmd.function(), Some(9));
    {
        let parms = cmd.host_parms();
        assert!(matches!(parms[0], HostParm::U64(0x1122_3344_5566_7788)));
        assert!(matches!(parms[1], HostParm::U64(42)));
    }
    assert_eq!(restored.dev.pending_hgcm_commands(), 1);

    if let HostParm::U64(v) = &mut cmd.host_parms()[1] {
        *v = 43;
    }
    restored.port.completed(&cmd, Status::SUCCESS);
    restored.dev.process_completions();
    // Second parameter value: header, one 16 byte record, then the type tag.
    let off = std::mem::size_of::<HgcmCall>() as u64 + 16 + 4;
    assert_eq!(restored.read(REQ + off, 8), 43u64.to_le_bytes().to_vec());
    assert_ne!(restored.header(REQ).flags & VBOX_HGCM_REQ_DONE, 0);
}

#[test]
fn cancelled_commands_not_restored() {
    let env = Env::new();
    submit_value_and_out_call(&env);
    env.submit(CANCEL_REQ, &cancel2_request(REQ as u32));
    let saved = env.dev.save_hgcm_state();

    let restored = Env::with_memory(env.mem.clone(), config(BUDGET));
    restored.dev.load_hgcm_state(19, &saved).unwrap();
    assert_eq!(restored.dev.hgcm_load_done(), 0);
    assert!(restored.connector.seen.lock().is_empty());
    assert_eq!(restored.dev.heap_available(HeapCategory::Kernel), BUDGET);
}

/// Page array format of version 10 with one LinAddr entry for parameter 1.
fn page_array_state(gcphys: u64, cb: u32, page: u64) -> Vec<u8> {
    let mut s = Vec::new();
    s.extend_from_slice(&1u32.to_le_bytes());
    s.extend_from_slice(&gcphys.to_le_bytes());
    s.extend_from_slice(&cb.to_le_bytes());
    s.extend_from_slice(&0u32.to_le_bytes()); // version <= 12 word
    s.extend_from_slice(&3u32.to_le_bytes()); // call
    s.push(0);
    s.extend_from_slice(&1u32.to_le_bytes());
    s.extend_from_slice(&1u32.to_le_bytes()); // total pages
    s.extend_from_slice(&1u32.to_le_bytes()); // parameter index
    s.extend_from_slice(&0u32.to_le_bytes());
    s.extend_from_slice(&1u32.to_le_bytes());
    s.extend_from_slice(&page.to_le_bytes());
    s.extend_from_slice(&0u32.to_le_bytes());
    s.extend_from_slice(&0u32.to_le_bytes());
    s
}

#[test]
fn page_array_state_uses_saved_pages() {
    let mem = Arc::new(VecGuestMemory::new(&[(GuestAddress(0), 0x10_0000)]));
    mem.map_linear(DATA_LINEAR, GuestAddress(DATA_PHYS), 4096);
    mem.write_all_at_addr(&[1, 2, 3, 4], GuestAddress(OTHER_PHYS))
        .unwrap();
    let req = call_request(
        RequestType::HgcmCall32,
        2,
        4,
        &[
            value32(1),
            linaddr32(ParmType::LinAddr, 4, DATA_LINEAR as u32),
        ],
    );
    mem.write_all_at_addr(&req, GuestAddress(REQ)).unwrap();

    let env = Env::with_memory(mem, config(BUDGET));
    env.dev
        .load_hgcm_state(10, &page_array_state(REQ, req.len() as u32, OTHER_PHYS))
        .unwrap();
    assert_eq!(env.dev.hgcm_load_done(), 1);

    let cmd = env.connector.take_pending().remove(0);
    assert!(cmd.is_restored());
    match &cmd.host_parms()[1] {
        HostParm::Buffer(buf) => assert_eq!(buf.data, vec![1, 2, 3, 4]),
        other => panic!("unexpected host parameter {:?}", other),
    };
}

#[test]
fn page_array_state_mismatch_fails_request() {
    let mem = Arc::new(VecGuestMemory::new(&[(GuestAddress(0), 0x10_0000)]));
    let req = call_request(RequestType::HgcmCall32, 2, 4, &[value32(1)]);
    mem.write_all_at_addr(&req, GuestAddress(REQ)).unwrap();

    let env = Env::with_memory(mem, config(BUDGET));
    // Saved with a different request size than the guest now declares.
    env.dev
        .load_hgcm_state(10, &page_array_state(REQ, req.len() as u32 + 8, OTHER_PHYS))
        .unwrap();
    assert_eq!(env.dev.hgcm_load_done(), 0);
    let hdr = env.header(REQ);
    assert_eq!(hdr.header.rc, Status::MISMATCH.0);
    assert_eq!(hdr.result, Status::MISMATCH.0);
    assert_ne!(hdr.flags & VBOX_HGCM_REQ_DONE, 0);
    assert!(env.connector.seen.lock().is_empty());
    assert_eq!(env.dev.heap_available(HeapCategory::Kernel), BUDGET);
}

#[test]
fn ancient_state_rebuilds_disconnect() {
    let mem = Arc::new(VecGuestMemory::new(&[(GuestAddress(0), 0x10_0000)]));
    let req = disconnect_request(11);
    mem.write_all_at_addr(&req, GuestAddress(REQ)).unwrap();

    let mut state = Vec::new();
    state.extend_from_slice(&1u32.to_le_bytes());
    state.extend_from_slice(&REQ.to_le_bytes());
    state.extend_from_slice(&(req.len() as u32).to_le_bytes());

    let env = Env::with_memory(mem, config(BUDGET));
    env.dev.load_hgcm_state(8, &state).unwrap();
    assert_eq!(env.dev.hgcm_load_done(), 1);
    assert_eq!(*env.connector.seen.lock(), vec![Seen::Disconnect(11)]);
}

#[test]
fn unsupported_and_truncated_states() {
    let env = Env::new();
    assert!(matches!(
        env.dev.load_hgcm_state(20, &[0; 8]),
        Err(SavedStateError::UnsupportedVersion(20))
    ));
    assert!(matches!(
        env.dev.load_hgcm_state(5, &[0; 8]),
        Err(SavedStateError::UnsupportedVersion(5))
    ));

    submit_value_and_out_call(&env);
    let saved = env.dev.save_hgcm_state();
    let restored = Env::with_memory(env.mem.clone(), config(BUDGET));
    assert!(matches!(
        restored.dev.load_hgcm_state(19, &saved[..saved.len() - 6]),
        Err(SavedStateError::Truncated(_))
    ));
    assert_eq!(restored.dev.pending_hgcm_commands(), 0);
    assert_eq!(restored.dev.heap_available(HeapCategory::Kernel), BUDGET);
}

#[test]
fn saved_call_with_too_many_parameters_rejected() {
    let mut state = Vec::new();
    state.extend_from_slice(&1u32.to_le_bytes());
    state.extend_from_slice(&3u32.to_le_bytes()); // call
    state.push(0);
    state.extend_from_slice(&REQ.to_le_bytes());
    state.extend_from_slice(&0x1_0000u32.to_le_bytes());
    state.extend_from_slice(&(RequestType::HgcmCall32 as u32).to_le_bytes());
    state.extend_from_slice(&2000u32.to_le_bytes());

    let env = Env::new();
    assert!(matches!(
        env.dev.load_hgcm_state(19, &state),
        Err(SavedStateError::Invalid(_))
    ));
    assert_eq!(env.dev.pending_hgcm_commands(), 0);
    assert_eq!(env.dev.heap_available(HeapCategory::Kernel), BUDGET);
}

#[test]
fn malformed_headers_ignored() {
    let env = Env::new();
    let mut req = call_request(RequestType::HgcmCall32, 1, 1, &[]);
    req[4] = 0; // version
    env.submit(REQ, &req);
    assert_eq!(env.header(REQ).header.rc, 0);
    assert!(env.connector.seen.lock().is_empty());
}

#[test]
fn requests_refused_before_additions() {
    let env = Env::new();
    env.dev.set_additions_ok(false);
    env.submit(REQ, &call_request(RequestType::HgcmCall32, 1, 1, &[]));
    assert_eq!(env.header(REQ).header.rc, Status::NOT_SUPPORTED.0);
    assert!(env.connector.seen.lock().is_empty());
    assert_eq!(env.dev.fast_ack_events(), u32::MAX);
}

#[test]
fn unknown_request_type() {
    let env = Env::new();
    let mut hdr = request_header(32, RequestType::AcknowledgeEvents);
    hdr.request_type = 999;
    let mut req = hdr.as_bytes().to_vec();
    req.resize(32, 0);
    env.submit(REQ, &req);
    assert_eq!(env.header(REQ).header.rc, Status::NOT_SUPPORTED.0);
}

#[test]
fn hgcm_without_connector_not_supported() {
    let mem = Arc::new(VecGuestMemory::new(&[(GuestAddress(0), 0x10_0000)]));
    let dev = Vmmdev::new(mem.clone(), Arc::new(TestIrq::default()), config(BUDGET));
    dev.set_additions_ok(true);
    let req = connect_request(VMMDEV_HGCM_LOC_LOCALHOST_EXISTING, "VBoxSharedClipboard");
    mem.write_all_at_addr(&req, GuestAddress(REQ)).unwrap();
    dev.handle_request(GuestAddress(REQ));
    let mut hdr = HgcmRequestHeader::new_zeroed();
    mem.read_exact_at_addr(hdr.as_mut_bytes(), GuestAddress(REQ))
        .unwrap();
    assert_eq!(hdr.header.rc, Status::NOT_SUPPORTED.0);

    mem.write_all_at_addr(&cancel2_request(REQ as u32), GuestAddress(CANCEL_REQ))
        .unwrap();
    dev.handle_request(GuestAddress(CANCEL_REQ));
    let mut rc = 0i32;
    mem.read_exact_at_addr(rc.as_mut_bytes(), GuestAddress(CANCEL_REQ + 12))
        .unwrap();
    assert_eq!(rc, Status::NOT_SUPPORTED.0);
}

#[test]
fn budget_exhaustion_fails_call() {
    let mem = Arc::new(VecGuestMemory::new(&[(GuestAddress(0), 0x10_0000)]));
    let env = Env::with_memory(mem, config(256));
    env.submit(REQ, &call_request(RequestType::HgcmCall32, 1, 1, &[value32(0)]));
    assert_eq!(env.header(REQ).header.rc, Status::NO_MEMORY.0);
    assert!(env.connector.seen.lock().is_empty());
    let stats = env.dev.stats();
    let (_, kernel) = stats
        .heap
        .iter()
        .find(|(c, _)| *c == HeapCategory::Kernel)
        .unwrap();
    assert_eq!(kernel.overruns, 1);
    assert_eq!(kernel.available, 256);
}

#[test]
fn acknowledge_and_filter_requests() {
    let env = Env::new();
    let filter = CtlGuestFilterMask {
        header: request_header(32, RequestType::CtlGuestFilterMask),
        or_mask: VMMDEV_EVENT_HGCM,
        not_mask: 0,
    };
    env.submit(CANCEL_REQ, filter.as_bytes());
    assert_eq!(env.header(CANCEL_REQ).header.rc, Status::SUCCESS.0);

    // The guest can not switch HGCM notifications off again.
    let filter = CtlGuestFilterMask {
        not_mask: VMMDEV_EVENT_HGCM,
        or_mask: 0,
        ..filter
    };
    env.submit(CANCEL_REQ, filter.as_bytes());

    env.dev.notify_guest(VMMDEV_EVENT_HGCM);
    assert!(env.irq.level.load(Ordering::SeqCst));
    let ack = Events {
        header: request_header(28, RequestType::AcknowledgeEvents),
        events: 0,
    };
    env.submit(REQ, ack.as_bytes());
    let events = u32::from_le_bytes(env.read(REQ + 24, 4).try_into().unwrap());
    assert_eq!(events, VMMDEV_EVENT_HGCM);
    assert!(!env.irq.level.load(Ordering::SeqCst));
    assert_eq!(env.dev.stats().slow_acks, 1);

    // Wrong size for the exact sized requests.
    let mut bad = ack.as_bytes().to_vec();
    bad[0] = 32;
    bad.resize(32, 0);
    env.submit(REQ, &bad);
    assert_eq!(env.header(REQ).header.rc, Status::INVALID_PARAMETER.0);
}

#[test]
fn reset_drops_commands() {
    let env = Env::new();
    let cmd = submit_value_and_out_call(&env);
    env.submit(
        0x5000,
        &connect_request(VMMDEV_HGCM_LOC_LOCALHOST_EXISTING, "VBoxGuestPropSvc"),
    );
    assert_eq!(env.dev.pending_hgcm_commands(), 2);
    env.dev.reset();
    assert_eq!(env.dev.pending_hgcm_commands(), 0);
    assert_eq!(env.dev.heap_available(HeapCategory::Kernel), BUDGET);
    assert_eq!(env.mem.locked_page_count(), 0);

    // A late completion of a dropped command is ignored.
    env.port.completed(&cmd, Status::SUCCESS);
    env.dev.process_completions();
    assert_eq!(env.header(REQ).flags & VBOX_HGCM_REQ_DONE, 0);
}
