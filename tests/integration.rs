use std::{
    io::{self, Write},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use piverify::{
    args::{ArgPacker, Catalog, FunctionId},
    diag::Format,
    trace::{BeginEvent, CallToken, EndEvent, Status},
    usm::AllocKind,
    verify::SlotMap,
    Config, Engine, FindingKind, Severity,
};

#[derive(Clone, Default)]
struct Output(Arc<Mutex<Vec<u8>>>);

impl Output {
    fn text(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

const CONTEXT: u64 = 0xc0;
const DEVICE: u64 = 0xd0;
const QUEUE: u64 = 0x9;

/// A host function: the id it traces with and the name it reports
#[derive(Clone, Copy)]
struct Function(FunctionId, &'static str);

const DEVICE_ALLOC: Function = Function(102, "piextUSMDeviceAlloc");
const FREE: Function = Function(104, "piextUSMFree");
const MEMSET: Function = Function(105, "piextUSMEnqueueMemset");
const MEMCPY: Function = Function(106, "piextUSMEnqueueMemcpy");
const MEMSET_2D: Function = Function(117, "piextUSMEnqueueMemset2D");

struct Host {
    engine: Engine,
    slots: Arc<SlotMap>,
    out: Output,
}

impl Host {
    fn new(config: Config) -> Self {
        let slots = Arc::new(SlotMap::new());
        let out = Output::default();
        let engine = Engine::new(
            &config,
            Catalog::builtin().unwrap(),
            Box::new(Arc::clone(&slots)),
            Box::new(out.clone()),
        );
        Self { engine, slots, out }
    }

    fn with_hook(config: Config, fired: &Arc<AtomicUsize>) -> Self {
        let host = Self::new(config);
        let fired = Arc::clone(fired);
        Host {
            engine: host.engine.with_terminate_hook(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }),
            ..host
        }
    }

    /// One full begin/end pair
    fn call(
        &self,
        token: CallToken,
        Function(function_id, name): Function,
        args: &[u8],
    ) -> Vec<piverify::Finding> {
        let mut findings = self.engine.on_begin(&BeginEvent {
            token,
            function_id,
            function_name: Some(name),
            args,
            location: None,
        });
        findings.extend(self.engine.on_end(&EndEvent {
            token,
            function_id,
            function_name: Some(name),
            args,
            status: Some(Status::SUCCESS),
        }));
        findings
    }

    fn alloc(&self, token: CallToken, slot: u64, base: u64, size: u64) -> Vec<piverify::Finding> {
        self.slots.write(slot, base);
        let args = ArgPacker::new()
            .address(slot)
            .address(CONTEXT)
            .address(DEVICE)
            .address(0)
            .size(size)
            .u32(0)
            .finish();
        self.call(token, DEVICE_ALLOC, &args)
    }

    fn free(&self, token: CallToken, ptr: u64) -> Vec<piverify::Finding> {
        let args = ArgPacker::new().address(CONTEXT).address(ptr).finish();
        self.call(token, FREE, &args)
    }

    fn memset(&self, token: CallToken, ptr: u64, count: u64) -> Vec<piverify::Finding> {
        let args = ArgPacker::new()
            .address(QUEUE)
            .address(ptr)
            .i32(0)
            .size(count)
            .u32(0)
            .address(0)
            .address(0)
            .finish();
        self.call(token, MEMSET, &args)
    }

    fn memcpy(&self, token: CallToken, dst: u64, src: u64, size: u64) -> Vec<piverify::Finding> {
        let args = ArgPacker::new()
            .address(QUEUE)
            .u32(1)
            .address(dst)
            .address(src)
            .size(size)
            .u32(0)
            .address(0)
            .address(0)
            .finish();
        self.call(token, MEMCPY, &args)
    }

    fn memset_2d(
        &self,
        token: CallToken,
        ptr: u64,
        pitch: u64,
        width: u64,
        height: u64,
    ) -> Vec<piverify::Finding> {
        let args = ArgPacker::new()
            .address(QUEUE)
            .address(ptr)
            .size(pitch)
            .i32(0)
            .size(width)
            .size(height)
            .u32(0)
            .address(0)
            .address(0)
            .finish();
        self.call(token, MEMSET_2D, &args)
    }
}

fn kinds(findings: &[piverify::Finding]) -> Vec<FindingKind> {
    findings.iter().map(|finding| finding.kind).collect()
}

#[test]
fn clean_program_has_no_findings() {
    let host = Host::new(Config::default());
    let t = |i| CallToken::new(1, i);
    assert!(host.alloc(t(1), 0x50, 0x1000, 64).is_empty());
    assert!(host.alloc(t(2), 0x50, 0x2000, 64).is_empty());
    assert!(host.memset(t(3), 0x1000, 64).is_empty());
    assert!(host.memcpy(t(4), 0x2000, 0x1000, 64).is_empty());
    assert!(host.free(t(5), 0x1000).is_empty());
    assert!(host.free(t(6), 0x2000).is_empty());
    assert!(host.engine.live_allocations().is_empty());
    assert!(host.engine.finish().is_empty());
    assert!(host.out.text().is_empty());
}

#[test]
fn use_after_free_is_reported_exactly_once() {
    let host = Host::new(Config::default());
    let t = |i| CallToken::new(1, i);
    host.alloc(t(1), 0x50, 0x1000, 64);
    host.free(t(2), 0x1000);
    let findings = host.memset(t(3), 0x1020, 8);
    assert_eq!(kinds(&findings), vec![FindingKind::UseAfterFree]);
    assert_eq!(findings[0].function.as_deref(), Some("piextUSMEnqueueMemset"));
    assert!(host.out.text().contains("use after free"));
}

#[test]
fn double_free_succeeds_then_fails() {
    let host = Host::new(Config::default());
    let t = |i| CallToken::new(1, i);
    host.alloc(t(1), 0x50, 0x1000, 64);
    assert!(host.free(t(2), 0x1000).is_empty());
    assert_eq!(kinds(&host.free(t(3), 0x1000)), vec![FindingKind::DoubleFree]);
}

#[test]
fn oversized_copy_is_out_of_bounds() {
    let host = Host::new(Config::default());
    let t = |i| CallToken::new(1, i);
    host.alloc(t(1), 0x50, 0x1000, 64);
    host.alloc(t(2), 0x50, 0x2000, 256);
    let findings = host.memcpy(t(3), 0x2000, 0x1000, 128);
    assert_eq!(kinds(&findings), vec![FindingKind::OutOfBounds]);
    assert_eq!(findings[0].argument.as_deref(), Some("src_ptr"));
}

#[test]
fn oversized_memset_is_out_of_bounds() {
    let host = Host::new(Config::default());
    let t = |i| CallToken::new(1, i);
    host.alloc(t(1), 0x50, 0x1000, 64);
    let findings = host.memset(t(2), 0x1000, 128);
    assert_eq!(kinds(&findings), vec![FindingKind::OutOfBounds]);
    assert_eq!(findings[0].argument.as_deref(), Some("ptr"));
    assert!(host.out.text().contains("past the end of the 64-byte allocation"));
}

#[test]
fn copy_into_a_short_destination_is_out_of_bounds() {
    let host = Host::new(Config::default());
    let t = |i| CallToken::new(1, i);
    host.alloc(t(1), 0x50, 0x1000, 64);
    host.alloc(t(2), 0x50, 0x2000, 256);
    let findings = host.memcpy(t(3), 0x1000, 0x2000, 128);
    assert_eq!(kinds(&findings), vec![FindingKind::OutOfBounds]);
    assert_eq!(findings[0].argument.as_deref(), Some("dst_ptr"));
}

#[test]
fn pitched_memset_past_the_last_row_is_out_of_bounds() {
    let host = Host::new(Config::default());
    let t = |i| CallToken::new(1, i);
    host.alloc(t(1), 0x50, 0x1000, 256);
    assert!(host.memset_2d(t(2), 0x1000, 64, 64, 4).is_empty());
    assert_eq!(
        kinds(&host.memset_2d(t(3), 0x1000, 64, 64, 5)),
        vec![FindingKind::OutOfBounds]
    );
}

#[test]
fn overlapping_allocation_is_rejected() {
    let host = Host::new(Config::default());
    host.alloc(CallToken::new(1, 1), 0x50, 100, 100);
    let findings = host.alloc(CallToken::new(1, 2), 0x50, 150, 100);
    assert_eq!(kinds(&findings), vec![FindingKind::AllocationConflict]);
    let live = host.engine.live_allocations();
    assert_eq!(live.len(), 1);
    assert_eq!((live[0].base, live[0].length), (100, 100));
    assert_eq!(live[0].kind, AllocKind::Device);
}

#[test]
fn wild_pointer_does_not_stop_the_program() {
    let fired = Arc::new(AtomicUsize::new(0));
    let host = Host::with_hook(Config::default(), &fired);
    let t = |i| CallToken::new(1, i);

    assert_eq!(kinds(&host.memset(t(1), 0xdead_0000, 4)), vec![FindingKind::WildPointer]);
    host.alloc(t(2), 0x50, 0x1000, 64);
    assert!(host.memset(t(3), 0x1000, 64).is_empty());
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert_eq!(host.out.text().matches("[piverify]").count(), 1);
}

#[test]
fn wild_pointer_stays_below_an_error_threshold() {
    let fired = Arc::new(AtomicUsize::new(0));
    let config = Config {
        terminate_at: Some(Severity::Error),
        ..Config::default()
    };
    let host = Host::with_hook(config, &fired);
    let t = |i| CallToken::new(1, i);

    assert_eq!(kinds(&host.memset(t(1), 0xdead_0000, 4)), vec![FindingKind::WildPointer]);
    host.alloc(t(2), 0x50, 0x1000, 64);
    assert!(host.memset(t(3), 0x1000, 64).is_empty());
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn protocol_violations_are_reported_and_survived() {
    let host = Host::new(Config {
        terminate_at: Some(Severity::Warning),
        ..Config::default()
    });
    let token = CallToken::new(4, 4);
    let args = ArgPacker::new().address(CONTEXT).address(0).finish();

    let end = EndEvent {
        token,
        function_id: FREE.0,
        function_name: Some(FREE.1),
        args: &args,
        status: Some(Status::SUCCESS),
    };
    assert_eq!(kinds(&host.engine.on_end(&end)), vec![FindingKind::UnmatchedEndEvent]);

    let begin = BeginEvent {
        token,
        function_id: FREE.0,
        function_name: Some(FREE.1),
        args: &args,
        location: None,
    };
    assert!(host.engine.on_begin(&begin).is_empty());
    assert_eq!(kinds(&host.engine.on_begin(&begin)), vec![FindingKind::DuplicateBegin]);
    assert!(host.engine.on_end(&end).is_empty());
    assert_eq!(kinds(&host.engine.on_end(&end)), vec![FindingKind::UnmatchedEndEvent]);
}

#[test]
fn json_lines_output() {
    let host = Host::new(Config {
        format: Format::Json,
        ..Config::default()
    });
    host.memset(CallToken::new(1, 1), 0xbad0, 4);
    host.memset(CallToken::new(1, 2), 0, 4);

    let text = host.out.text();
    let records: Vec<serde_json::Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["kind"], "wild_pointer");
    assert_eq!(records[0]["address"], "0xbad0");
    assert_eq!(records[1]["kind"], "null_pointer");
    assert_eq!(records[1]["severity"], "error");
}

#[test]
fn concurrent_disjoint_cycles_are_clean() {
    const THREADS: u64 = 8;
    const CYCLES: u64 = 200;

    let host = Host::new(Config::default());
    crossbeam::scope(|scope| {
        for thread in 0..THREADS {
            let host = &host;
            scope.spawn(move |_| {
                let slot = 0x100 + thread * 8;
                let region = 0x1_0000_0000 + thread * 0x100_0000;
                let mut instance = 0;
                let mut token = || {
                    instance += 1;
                    CallToken::new(thread, instance)
                };
                for cycle in 0..CYCLES {
                    let base = region + cycle * 0x1000;
                    assert!(host.alloc(token(), slot, base, 0x200).is_empty());
                    assert!(host.memset(token(), base + 0x100, 0x100).is_empty());
                    if cycle % 4 != 0 {
                        assert!(host.free(token(), base).is_empty());
                    }
                }
            });
        }
    })
    .unwrap();

    let live: Vec<_> = host
        .engine
        .live_allocations()
        .into_iter()
        .map(|record| record.base)
        .collect();
    let mut expected: Vec<_> = (0..THREADS)
        .flat_map(|thread| {
            (0..CYCLES)
                .filter(|cycle| cycle % 4 == 0)
                .map(move |cycle| 0x1_0000_0000 + thread * 0x100_0000 + cycle * 0x1000)
        })
        .collect();
    expected.sort_unstable();
    assert_eq!(live, expected);
    assert!(host.out.text().is_empty());
}
