//! allio End-to-End Smoke Test
//!
//! Runs every scenario against every backend available on this platform:
//!   - file write/read round trip at offset 0
//!   - current-process wait is rejected up front
//!   - child process exit code
//!   - auto-reset event releases one waiter, manual-reset releases all
//!   - datagram receive with an instant deadline times out
//!   - accept + connect exchanging 42 / -42
//!   - pipe read woken by another thread
//!   - two threads driving one shared context
//!
//! Run: ./target/release/allio-smoke [io_uring|epoll|iocp|blocking ...]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll, Wake, Waker};
use std::time::Duration;

use allio::{Context, Deadline, Event, File, Process};
use allio_core::Error;
use allio_module::{MultiplexerConfig, MultiplexerKind};

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
    skipped: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0, skipped: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn skip(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.skipped += 1;
        println!("  [{:2}] {:<52} SKIP: {}", self.total, name, reason);
    }

    fn run(&mut self, name: &str, outcome: Result<(), String>) {
        match outcome {
            Ok(()) => self.pass(name),
            Err(reason) => self.fail(name, &reason),
        }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}  Skipped: {}",
            self.total, self.passed, self.failed, self.skipped
        );
        println!("{}", LINE);
    }
}

fn expect<T: PartialEq + std::fmt::Debug>(what: &str, got: T, want: T) -> Result<(), String> {
    if got == want {
        Ok(())
    } else {
        Err(format!("{}: got {:?}, want {:?}", what, got, want))
    }
}

fn check<T>(what: &str, r: allio::Result<T>) -> Result<T, String> {
    r.map_err(|e| format!("{}: {}", what, e))
}

struct NoopWake;

impl Wake for NoopWake {
    fn wake(self: Arc<Self>) {}
}

type Waiter<'a> = Pin<Box<dyn Future<Output = allio::Result<()>> + 'a>>;

/// A scenario; `concurrent` ones keep operations pending and cannot run on
/// the blocking backend, where starting an operation runs it to the end.
struct Scenario {
    name: &'static str,
    concurrent: bool,
    run: fn(&Context) -> Result<(), String>,
}

// ════════════════════════════════════════════════════════════
// Scenarios
// ════════════════════════════════════════════════════════════

fn file_round_trip(context: &Context) -> Result<(), String> {
    let path = std::env::temp_dir().join(format!("allio_smoke_{}_{}", std::process::id(), context.name()));
    let mut file = check("create", File::create(&path))?;
    check("attach", file.handle_mut().attach(context))?;
    let result = context.block_on(async {
        let n = file.write_at_async(context, 0, b"allio".to_vec(), Deadline::never()).await?;
        let data = file.read_at_async(context, 0, vec![0; 5], Deadline::never()).await?;
        Ok::<_, Error>((n, data))
    });
    drop(file);
    let _ = std::fs::remove_file(&path);
    let (n, data) = check("round trip", check("block_on", result)?)?;
    expect("written", n, 5)?;
    expect("read back", data.as_slice(), b"allio".as_slice())
}

fn current_process_wait(context: &Context) -> Result<(), String> {
    let current = check("current", Process::current())?;
    let waited = check("block_on", context.block_on(current.wait_async(context, Deadline::never())))?;
    expect("wait", waited, Err(Error::ProcessIsCurrentProcess))
}

fn child_exit_code(context: &Context) -> Result<(), String> {
    let child = check("launch", Process::launch("sh", ["-c", "exit 7"]))?;
    let code = check("block_on", context.block_on(child.wait_async(context, Deadline::never())))?;
    expect("exit code", code, Ok(7))
}

fn event_release(context: &Context, auto_reset: bool, waiters: usize, want: usize) -> Result<(), String> {
    let event = check("event", Event::new(auto_reset))?;
    let waker = Waker::from(Arc::new(NoopWake));
    let mut cx = TaskContext::from_waker(&waker);

    let mut pending: Vec<Waiter<'_>> = (0..waiters)
        .map(|_| Box::pin(event.wait_async(context, Deadline::never())) as Waiter<'_>)
        .collect();
    for waiter in pending.iter_mut() {
        if waiter.as_mut().poll(&mut cx).is_ready() {
            return Err("wait finished before signal".into());
        }
    }
    check("signal", event.signal())?;
    for _ in 0..10 {
        check("poll", context.poll(Deadline::relative(Duration::from_millis(20))))?;
    }
    let released = pending
        .iter_mut()
        .map(|waiter| waiter.as_mut().poll(&mut cx))
        .filter(|polled| matches!(polled, Poll::Ready(Ok(()))))
        .count();
    expect("released", released, want)
}

fn auto_reset_event(context: &Context) -> Result<(), String> {
    event_release(context, true, 3, 1)
}

fn manual_reset_event(context: &Context) -> Result<(), String> {
    event_release(context, false, 3, 3)
}

mod net {
    use super::*;
    use std::net::SocketAddr;
    use std::thread;

    use allio::{DatagramSocket, ListenSocket, Pipe, StreamSocket};

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    pub fn instant_receive(context: &Context) -> Result<(), String> {
        let socket = check("bind", DatagramSocket::bind(loopback()))?;
        let received = check(
            "block_on",
            context.block_on(socket.receive_from_async(context, vec![0; 16], Deadline::instant())),
        )?;
        expect("receive", received.err(), Some(Error::AsyncOperationTimedOut))
    }

    pub fn accept_connect(context: &Context) -> Result<(), String> {
        let listener = check("listen", ListenSocket::bind(loopback()))?;
        let address = check("local address", listener.local_address())?;
        let client = thread::spawn(move || -> allio::Result<Vec<u8>> {
            let stream = StreamSocket::new(&address)?;
            stream.connect(address, Deadline::relative(Duration::from_secs(5)))?;
            stream.write(vec![42], Deadline::never())?;
            stream.read(vec![0; 1], Deadline::never())
        });
        let served = context.block_on(async {
            let (stream, _) = listener.accept_async(context, Deadline::never()).await?;
            let request = stream.read_async(context, vec![0; 1], Deadline::never()).await?;
            let reply = request.first().map(|b| (*b as i8).wrapping_neg() as u8).unwrap_or(0);
            stream.write_async(context, vec![reply], Deadline::never()).await?;
            Ok::<_, Error>(request)
        });
        let served = check("server", check("block_on", served)?)?;
        let reply = match client.join() {
            Ok(r) => check("client", r)?,
            Err(_) => return Err("client thread panicked".into()),
        };
        expect("request", served, vec![42])?;
        expect("reply", reply, vec![(-42i8) as u8])
    }

    pub fn pipe_wakeup(context: &Context) -> Result<(), String> {
        let (reader, writer) = check("pipe", Pipe::create())?;
        let feeder = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.write(b"ping".to_vec(), Deadline::never())
        });
        let data = check(
            "block_on",
            context.block_on(reader.read_async(context, vec![0; 8], Deadline::never())),
        )?;
        let _ = feeder.join();
        expect("read", check("read", data)?.as_slice(), b"ping".as_slice())
    }

    /// A reader thread and a writer thread both `block_on` the same context.
    pub fn shared_context(context: &Context) -> Result<(), String> {
        let (mut reader, mut writer) = check("pipe", Pipe::create())?;
        check("attach", reader.handle_mut().attach(context))?;
        check("attach", writer.handle_mut().attach(context))?;
        let shared = context.clone();
        let waiter = thread::spawn(move || {
            shared.block_on(reader.read_async(&shared, vec![0; 8], Deadline::never()))
        });
        thread::sleep(Duration::from_millis(50));
        let written = check(
            "block_on",
            context.block_on(writer.write_async(context, b"ping".to_vec(), Deadline::never())),
        )?;
        expect("write", check("write", written)?, 4)?;
        let data = match waiter.join() {
            Ok(r) => check("read", check("block_on", r)?)?,
            Err(_) => return Err("reader thread panicked".into()),
        };
        expect("read", data.as_slice(), b"ping".as_slice())
    }
}

fn scenarios() -> Vec<Scenario> {
    let mut list = vec![
        Scenario { name: "file: write/read \"allio\" at 0", concurrent: false, run: file_round_trip },
        Scenario { name: "process: current-process wait rejected", concurrent: false, run: current_process_wait },
        Scenario { name: "event: auto-reset releases 1 of 3", concurrent: true, run: auto_reset_event },
        Scenario { name: "event: manual-reset releases 3 of 3", concurrent: true, run: manual_reset_event },
    ];
    if cfg!(unix) {
        list.push(Scenario { name: "process: child exit code", concurrent: false, run: child_exit_code });
    }
    list.extend([
        Scenario { name: "udp: instant receive times out", concurrent: false, run: net::instant_receive },
        Scenario { name: "tcp: accept/connect 42 -> -42", concurrent: true, run: net::accept_connect },
        Scenario { name: "pipe: read woken by writer thread", concurrent: true, run: net::pipe_wakeup },
        Scenario { name: "context: two threads share one context", concurrent: true, run: net::shared_context },
    ]);
    list
}

fn platform_backends() -> Vec<MultiplexerKind> {
    if cfg!(target_os = "linux") {
        vec![MultiplexerKind::IoUring, MultiplexerKind::Epoll, MultiplexerKind::Blocking]
    } else if cfg!(windows) {
        vec![MultiplexerKind::Iocp, MultiplexerKind::Blocking]
    } else {
        vec![MultiplexerKind::Blocking]
    }
}

fn run_backend(t: &mut TestRunner, kind: MultiplexerKind) {
    t.section(&format!("Backend: {}", kind));
    let context = match Context::new(&MultiplexerConfig::from_env().kind(kind)) {
        Ok(c) => c,
        Err(e) => {
            t.skip(&format!("create {}", kind), &e.to_string());
            return;
        }
    };
    for scenario in scenarios() {
        if scenario.concurrent && kind == MultiplexerKind::Blocking {
            t.skip(scenario.name, "needs a pending-capable backend");
            continue;
        }
        t.run(scenario.name, (scenario.run)(&context));
    }
}

// ════════════════════════════════════════════════════════════

fn main() {
    println!("=== allio End-to-End Smoke Test ===");

    let requested: Vec<MultiplexerKind> = std::env::args()
        .skip(1)
        .filter_map(|arg| match arg.parse() {
            Ok(kind) => Some(kind),
            Err(()) => {
                println!("    ignoring unknown backend {:?}", arg);
                None
            }
        })
        .collect();
    let backends = if requested.is_empty() { platform_backends() } else { requested };

    let mut t = TestRunner::new();
    for kind in backends {
        run_backend(&mut t, kind);
    }

    t.summary();
    std::process::exit(if t.failed > 0 { 1 } else { 0 });
}
