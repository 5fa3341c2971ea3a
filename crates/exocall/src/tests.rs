//! Tests for the channel and contexts with a recording transport.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use neotype::Builtins;
use neotype::Field;
use neotype::TypeRef;
use neotype::TypeRegistry;
use neotype::install_builtin_types;
use neotype::standard_registry;
use neowire::CommitFrame;
use neowire::LogFrame;
use neowire::ReplyFrame;
use neowire::Value;
use rand::Rng;

use crate::channel;
use crate::channel::ProtocolError;
use crate::handles;
use crate::resolve::CandidateError;
use crate::resolve::CoercionError;
use crate::resolve::Resolver;
use crate::transport;
use crate::*;

/// Records every payload; never produces events.
#[derive(Clone, Default)]
struct Recorder {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    fail: Arc<AtomicBool>,
}

impl Recorder {
    fn frames(&self) -> Vec<CommitFrame> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|bytes| CommitFrame::decode(bytes).expect("valid commit frame"))
            .collect()
    }

    fn last(&self) -> CommitFrame {
        self.frames().pop().expect("at least one frame")
    }
}

#[async_trait::async_trait]
impl Transport for Recorder {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(transport::Error::ConnectionLost("unplugged".into()));
        }
        self.sent.lock().unwrap().push(payload.to_vec());
        Ok(())
    }

    async fn recv(&self) -> transport::Result<Option<TransportEvent>> {
        Ok(None)
    }
}

/// Collects callback invocations.
#[derive(Clone, Default)]
struct Capture {
    results: Arc<Mutex<Vec<CommitResult>>>,
}

impl Capture {
    fn callback(&self) -> impl FnOnce(CommitResult) + Send + 'static {
        let results = self.results.clone();
        move |result| results.lock().unwrap().push(result)
    }

    fn taken(&self) -> Vec<CommitResult> {
        std::mem::take(&mut *self.results.lock().unwrap())
    }
}

fn open(registry: TypeRegistry, ready: bool) -> (Channel, Recorder) {
    let recorder = Recorder::default();
    let channel = ChannelBuilder::new()
        .name("test")
        .registry(registry)
        .transport(recorder.clone())
        .ready(ready)
        .build()
        .expect("channel builds");
    (channel, recorder)
}

fn standard(ready: bool) -> (Channel, Recorder) {
    open(standard_registry().0, ready)
}

/// Builtin types plus a single `int32 add(int32, int32)`.
fn add_only() -> TypeRegistry {
    let mut reg = TypeRegistry::new();
    let b = install_builtin_types(&mut reg);
    let add = reg.register_function_type(1000, &b.int32, &[b.int32.clone(), b.int32.clone()], false);
    reg.register_function("add", &[add]);
    reg
}

fn reply(correlation_id: u64, values: Vec<Value>) -> Vec<u8> {
    ReplyFrame::new(correlation_id, values).encode().unwrap()
}

fn ty(channel: &Channel, name: &str) -> TypeRef {
    channel.registry().by_name(name).cloned().unwrap()
}

// ============================================================================
//  1. BATCHING AND COMMIT
// ============================================================================

#[tokio::test]
async fn test_two_calls_one_message() {
    let (channel, recorder) = open(add_only(), true);
    let mut ctx = channel.context();
    let capture = Capture::default();

    let r1 = ctx.call("add", &[3.into(), 4.into()]).unwrap().unwrap();
    let r2 = ctx.call("add", &[(&r1).into(), 5.into()]).unwrap().unwrap();
    let id = ctx.commit(&[r1.clone(), r2.clone()], capture.callback()).await.unwrap();

    let frames = recorder.frames();
    assert_eq!(frames.len(), 1);
    let frame = &frames[0];
    assert_eq!(frame.correlation_id, id);
    assert_eq!(frame.output_handle_ids, vec![r1.id(), r2.id()]);
    assert_eq!(frame.commands.len(), 2);
    assert_eq!(frame.commands[0].signature_id, 1000);
    assert_eq!(frame.commands[0].result_handle_id, r1.id());
    assert_eq!(frame.commands[1].arg_is_handle, vec![true, false]);
    assert_eq!(frame.commands[1].args[0], Value::Int(r1.id().into()));

    channel.on_message(&reply(id, vec![Value::Int(7), Value::Int(12)])).unwrap();
    let results = capture.taken();
    assert_eq!(results.len(), 1);
    let values = results[0].as_ref().unwrap();
    assert_eq!(values, &vec![Resolved::Value(Value::Int(7)), Resolved::Value(Value::Int(12))]);
}

#[tokio::test]
async fn test_empty_commit_still_sends() {
    let (channel, recorder) = standard(true);
    let capture = Capture::default();

    let id = channel.commit(&[], capture.callback()).await.unwrap();
    let frame = recorder.last();
    assert!(frame.commands.is_empty());
    assert!(frame.output_handle_ids.is_empty());

    channel.on_message(&reply(id, vec![])).unwrap();
    assert_eq!(capture.taken(), vec![Ok(vec![])]);
}

#[tokio::test]
async fn test_commit_drains_batch() {
    let (channel, recorder) = open(add_only(), true);
    let mut ctx = channel.context();
    ctx.call("add", &[1.into(), 2.into()]).unwrap();
    assert_eq!(channel.batch_len(), 1);

    ctx.commit(&[], |_| {}).await.unwrap();
    ctx.commit(&[], |_| {}).await.unwrap();
    assert_eq!(channel.batch_len(), 0);

    let frames = recorder.frames();
    assert_eq!(frames[0].commands.len(), 1);
    assert!(frames[1].commands.is_empty());
    assert_eq!((frames[0].correlation_id, frames[1].correlation_id), (1, 2));
    ctx.destroy().unwrap();
}

#[tokio::test]
async fn test_void_call_has_no_result_handle() {
    let (channel, recorder) = standard(true);
    let mut ctx = channel.context();
    let p = ctx.call("malloc", &[16.into()]).unwrap().unwrap();
    assert!(ctx.call("free", &[(&p).into()]).unwrap().is_none());
    ctx.commit(&[], |_| {}).await.unwrap();

    let frame = recorder.last();
    assert_eq!(frame.commands[1].name, "free");
    assert_eq!(frame.commands[1].result_handle_id, 0);
    ctx.destroy().unwrap();
}

#[tokio::test]
async fn test_send_failure_drops_pending() {
    let (channel, recorder) = standard(true);
    recorder.fail.store(true, Ordering::SeqCst);
    let err = channel.commit(&[], |_| panic!("never called")).await.unwrap_err();
    assert!(matches!(err, channel::Error::Transport(_)));
    assert_eq!(channel.pending_commits(), 0);
}

#[tokio::test]
async fn test_channel_is_shared_across_tasks() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Channel>();

    let (channel, recorder) = standard(true);
    let capture = Capture::default();

    let committer = channel.clone();
    let callback = capture.callback();
    let id = tokio::spawn(async move { committer.commit(&[], callback).await })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(channel.pending_commits(), 1);

    let replier = channel.clone();
    tokio::spawn(async move { replier.on_message(&reply(id, vec![])) })
        .await
        .unwrap()
        .unwrap();

    assert_eq!(recorder.frames().len(), 1);
    assert_eq!(channel.pending_commits(), 0);
    assert_eq!(capture.taken(), vec![Ok(vec![])]);
}

// ============================================================================
//  2. REPLIES
// ============================================================================

#[tokio::test]
async fn test_duplicate_reply_is_protocol_error() {
    let (channel, _recorder) = standard(true);
    let capture = Capture::default();
    let id = channel.commit(&[], capture.callback()).await.unwrap();

    channel.on_message(&reply(id, vec![])).unwrap();
    let err = channel.on_message(&reply(id, vec![])).unwrap_err();
    assert_eq!(err, channel::Error::Protocol(ProtocolError::UnknownCorrelation(id)));
    assert_eq!(capture.taken().len(), 1);
}

#[tokio::test]
async fn test_unknown_correlation_is_protocol_error() {
    let (channel, _recorder) = standard(true);
    let err = channel.on_message(&reply(99, vec![])).unwrap_err();
    assert_eq!(err, channel::Error::Protocol(ProtocolError::UnknownCorrelation(99)));
}

#[tokio::test]
async fn test_malformed_message() {
    let (channel, _recorder) = standard(true);
    let err = channel.on_message(b"[1, 2]").unwrap_err();
    assert!(matches!(err, channel::Error::Protocol(ProtocolError::Malformed(_))));
}

#[tokio::test]
async fn test_outputs_map_ids_back_to_handles() {
    let (channel, _recorder) = standard(true);
    let mut ctx = channel.context();
    let capture = Capture::default();

    let p = ctx.malloc_typed(&ty(&channel, "int32")).unwrap();
    let n = ctx.call("add", &[1.into(), 2.into()]).unwrap().unwrap();
    let s = ctx.allocate(ty(&channel, "String"));
    let id = ctx.commit(&[p.clone(), n.clone(), s.clone()], capture.callback()).await.unwrap();

    let values = vec![Value::Int(p.id().into()), Value::Int(3), Value::from("hello")];
    channel.on_message(&reply(id, values)).unwrap();

    let results = capture.taken();
    let resolved = results[0].as_ref().unwrap();
    assert_eq!(resolved.len(), 3);
    assert_eq!(resolved[0].as_handle().map(Handle::id), Some(p.id()));
    assert_eq!(resolved[1].as_i64(), Some(3));
    assert_eq!(resolved[2].as_value(), Some(&Value::from("hello")));
    ctx.destroy().unwrap();
}

#[tokio::test]
async fn test_reply_with_dead_handle_id() {
    let (channel, _recorder) = standard(true);
    let mut ctx = channel.context();
    let capture = Capture::default();

    let p = ctx.call("malloc", &[8.into()]).unwrap().unwrap();
    let id = ctx.commit(&[p], capture.callback()).await.unwrap();
    let err = channel.on_message(&reply(id, vec![Value::Int(4242)])).unwrap_err();

    let expected = ProtocolError::UnknownHandle { correlation_id: id, index: 0, id: 4242 };
    assert_eq!(err, channel::Error::Protocol(expected.clone()));
    assert_eq!(capture.taken(), vec![Err(channel::Error::Protocol(expected))]);
    ctx.destroy().unwrap();
}

#[tokio::test]
async fn test_reply_with_non_id_for_pointer() {
    let (channel, _recorder) = standard(true);
    let mut ctx = channel.context();
    let p = ctx.call("malloc", &[8.into()]).unwrap().unwrap();
    let id = ctx.commit(&[p], |_| {}).await.unwrap();
    let err = channel.on_message(&reply(id, vec![Value::from("oops")])).unwrap_err();
    assert!(matches!(err, channel::Error::Protocol(ProtocolError::NotAHandleId { index: 0, .. })));
    ctx.destroy().unwrap();
}

#[tokio::test]
async fn test_reply_value_count_mismatch() {
    let (channel, _recorder) = open(add_only(), true);
    let mut ctx = channel.context();
    let capture = Capture::default();

    let r = ctx.call("add", &[1.into(), 1.into()]).unwrap().unwrap();
    let id = ctx.commit(&[r], capture.callback()).await.unwrap();
    let err = channel.on_message(&reply(id, vec![])).unwrap_err();
    assert!(matches!(err, channel::Error::Protocol(ProtocolError::ValueCountMismatch { expected: 1, found: 0, .. })));
    ctx.destroy().unwrap();
}

#[tokio::test]
async fn test_log_lines_go_to_sink() {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    let channel = ChannelBuilder::new()
        .registry(standard_registry().0)
        .transport(Recorder::default())
        .log_sink(move |line| sink.lock().unwrap().push(line.to_string()))
        .build()
        .unwrap();

    let log = LogFrame { msg: "module loaded.".into() }.encode().unwrap();
    channel.on_message(&log).unwrap();
    assert_eq!(*lines.lock().unwrap(), vec!["module loaded."]);
}

// ============================================================================
//  3. READINESS AND TERMINATION
// ============================================================================

#[tokio::test]
async fn test_commits_queue_until_ready() {
    let (channel, recorder) = open(add_only(), false);
    let mut ctx = channel.context();

    ctx.call("add", &[1.into(), 2.into()]).unwrap();
    let first = ctx.commit(&[], |_| {}).await.unwrap();
    ctx.call("add", &[3.into(), 4.into()]).unwrap();
    let second = ctx.commit(&[], |_| {}).await.unwrap();

    assert!(recorder.frames().is_empty());
    assert_eq!(channel.queued_messages().await, 2);

    channel.on_ready().await.unwrap();
    let ids: Vec<u64> = recorder.frames().iter().map(|f| f.correlation_id).collect();
    assert_eq!(ids, vec![first, second]);
    assert_eq!(channel.queued_messages().await, 0);

    // A second ready does not resend.
    channel.on_ready().await.unwrap();
    assert_eq!(recorder.frames().len(), 2);
    ctx.destroy().unwrap();
}

#[tokio::test]
async fn test_termination_fails_pending_and_later_commits() {
    let (channel, recorder) = standard(false);
    let queued = Capture::default();
    channel.commit(&[], queued.callback()).await.unwrap();
    assert_eq!(channel.pending_commits(), 1);

    channel.on_peer_terminated("crashed").await;

    let results = queued.taken();
    assert!(matches!(&results[..], [Err(channel::Error::Terminated(reason))] if reason.contains("crashed")));
    assert_eq!(channel.pending_commits(), 0);
    assert_eq!(channel.queued_messages().await, 0);
    assert!(channel.is_terminated().await);

    let err = channel.commit(&[], |_| panic!("never called")).await.unwrap_err();
    assert!(matches!(err, channel::Error::Terminated(_)));

    // Ready after termination does not flush anything.
    channel.on_ready().await.unwrap();
    assert!(recorder.frames().is_empty());
}

#[tokio::test]
async fn test_transport_error_fails_sent_commits() {
    let (channel, _recorder) = standard(true);
    let capture = Capture::default();
    channel.commit(&[], capture.callback()).await.unwrap();
    channel.on_transport_error("pipe closed").await;
    assert!(matches!(&capture.taken()[..], [Err(channel::Error::Terminated(_))]));
}

// ============================================================================
//  4. RESOLUTION
// ============================================================================

#[tokio::test]
async fn test_overload_error_lists_every_candidate() {
    let mut reg = TypeRegistry::new();
    let b = install_builtin_types(&mut reg);
    let add_i = reg.register_function_type(1000, &b.int32, &[b.int32.clone(), b.int32.clone()], false);
    let add_f = reg.register_function_type(1001, &b.float64, &[b.float64.clone(), b.float64.clone()], false);
    reg.register_function("add", &[add_i, add_f]);

    let (channel, _recorder) = open(reg, true);
    let mut ctx = channel.context();
    let err = ctx.call("add", &["x".into(), Value::dict::<&str>(vec![]).into()]).unwrap_err();

    let CallError::Overload(err) = err else {
        panic!("expected overload error");
    };
    assert_eq!(err.candidates.len(), 2);
    assert_eq!(err.candidates[0].0, "int32_t add(int32_t, int32_t)");
    assert_eq!(err.candidates[1].0, "double add(double, double)");
    for (_, reason) in &err.candidates {
        assert!(matches!(reason, CandidateError::Argument { index: 0, error: CoercionError::Incompatible { .. } }));
    }
    let text = err.to_string();
    assert!(text.starts_with("No overload found for call \"add(\"x\", {})\"."));
    assert!(text.contains("Can't coerce String to int32_t"));
    assert!(text.contains("Can't coerce String to double"));

    assert_eq!(channel.batch_len(), 0);
    assert!(ctx.owned().is_empty());
}

#[tokio::test]
async fn test_unknown_function() {
    let (channel, _recorder) = standard(true);
    let mut ctx = channel.context();
    assert_eq!(ctx.call("frobnicate", &[]).unwrap_err(), CallError::UnknownFunction("frobnicate".into()));
}

#[tokio::test]
async fn test_released_handle_is_rejected() {
    let (channel, _recorder) = standard(true);
    let mut ctx = channel.context();
    let p = ctx.call("malloc", &[8.into()]).unwrap().unwrap();
    ctx.release(&[p.clone()]).unwrap();

    let err = ctx.call("free", &[(&p).into()]).unwrap_err();
    assert_eq!(err, CallError::Handle(handles::Error::UnknownHandle(p.id())));
}

#[tokio::test]
async fn test_variadic_accepts_extra_args() {
    let mut reg = TypeRegistry::new();
    let b = install_builtin_types(&mut reg);
    let printf = reg.register_function_type(1000, &b.int32, &[b.char_ptr.clone()], true);
    reg.register_function("printf", &[printf]);
    let (channel, recorder) = open(reg, true);
    let mut ctx = channel.context();

    ctx.call("printf", &["%d %s".into(), 1.into(), "two".into()]).unwrap();
    let err = ctx.call("printf", &[]).unwrap_err();
    let CallError::Overload(err) = err else { panic!("expected overload error") };
    assert_eq!(err.candidates[0].1, CandidateError::Arity { expected: 1, found: 0, variadic: true });

    ctx.commit(&[], |_| {}).await.unwrap();
    assert_eq!(recorder.last().commands[0].args.len(), 3);
    ctx.destroy().unwrap();
}

#[tokio::test]
async fn test_functions_lists_registry() {
    let (channel, _recorder) = open(add_only(), true);
    assert_eq!(channel.context().functions(), vec!["add"]);
}

/// Coercion within a numeric class follows size, then sign for literals.
#[test]
fn test_random_integer_coercions() {
    let (reg, b) = standard_registry();
    let resolver = Resolver::new(b.clone());
    let ints: Vec<TypeRef> = ["int8", "uint8", "int16", "uint16", "int32", "uint32", "int64", "uint64"]
        .iter()
        .map(|n| reg.by_name(n).cloned().unwrap())
        .collect();
    let mut rng = rand::thread_rng();

    for _ in 0..500 {
        let from = &ints[rng.gen_range(0..ints.len())];
        let to = &ints[rng.gen_range(0..ints.len())];
        let value = Value::Int(rng.gen_range(-1000..1000));
        let (f, t) = (from.as_primitive().unwrap(), to.as_primitive().unwrap());

        let expected = f.size < t.size || (f.size == t.size && !(f.signed && !t.signed && value.is_negative()));
        let actual = resolver.can_coerce(from, to, Some(&value)).is_ok();
        assert_eq!(actual, expected, "{} -> {} with {}", from, to, value);
    }

    let floats = [&b.float32, &b.float64];
    for _ in 0..50 {
        let from = floats[rng.gen_range(0..2)];
        let to = floats[rng.gen_range(0..2)];
        let expected = from.sizeof() <= to.sizeof();
        assert_eq!(resolver.can_coerce(from, to, None).is_ok(), expected, "{} -> {}", from, to);
    }
}

// ============================================================================
//  5. HANDLES, FINALIZERS, TEARDOWN
// ============================================================================

fn free_targets(frame: &CommitFrame) -> Vec<u32> {
    frame
        .commands
        .iter()
        .filter(|c| c.name == "free")
        .flat_map(|c| c.handle_args().collect::<Vec<_>>())
        .collect()
}

#[tokio::test]
async fn test_destroy_runs_finalizers_newest_first() {
    let (channel, recorder) = standard(true);
    let mut ctx = channel.context();
    let handles: Vec<Handle> = (0..3).map(|_| ctx.malloc_scoped(16).unwrap()).collect();
    let ids: Vec<u32> = handles.iter().map(Handle::id).collect();

    ctx.destroy().unwrap();
    channel.commit(&[], |_| {}).await.unwrap();

    let frame = recorder.last();
    assert_eq!(free_targets(&frame), ids.iter().rev().copied().collect::<Vec<_>>());
    let destroy = frame.commands.last().unwrap();
    assert_eq!(destroy.name, "*destroyHandles");
    assert_eq!(destroy.handle_args().collect::<Vec<_>>(), ids);
    assert_eq!(channel.live_handles(), 0);
}

#[tokio::test]
async fn test_release_subset() {
    let (channel, recorder) = standard(true);
    let mut ctx = channel.context();
    let a = ctx.malloc_scoped(4).unwrap();
    let b = ctx.malloc_scoped(4).unwrap();
    channel.commit(&[], |_| {}).await.unwrap();

    ctx.release(&[a.clone()]).unwrap();
    channel.commit(&[], |_| {}).await.unwrap();
    assert_eq!(free_targets(&recorder.last()), vec![a.id()]);
    assert_eq!(ctx.owned(), &[b.id()]);

    ctx.destroy().unwrap();
}

#[tokio::test]
async fn test_failing_finalizer_does_not_stop_teardown() {
    let (channel, _recorder) = standard(true);
    let mut ctx = channel.context();
    let order = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<Handle> = (0..3).map(|_| ctx.allocate(ty(&channel, "void*"))).collect();
    for h in &handles {
        let order = order.clone();
        let release = Release::custom(move |_, handle| {
            order.lock().unwrap().push(handle.id());
            if handle.id() % 2 == 0 { Err("boom".into()) } else { Ok(()) }
        });
        ctx.set_finalizer(h, release).unwrap();
    }

    let err = ctx.destroy().unwrap_err();
    assert_eq!(err.failures, vec![(handles[1].id(), "boom".to_string())]);
    let expected: Vec<u32> = handles.iter().rev().map(Handle::id).collect();
    assert_eq!(*order.lock().unwrap(), expected);
    assert_eq!(channel.live_handles(), 0);
}

/// Allocates a fresh handle with this same finalizer, forever.
fn regrow(ctx: &mut Context, _: &Handle) -> Result<(), String> {
    let void_ptr = ctx.channel().resolver().builtins().void_ptr.clone();
    let next = ctx.allocate(void_ptr);
    ctx.set_finalizer(&next, Release::custom(regrow)).map_err(|e| e.to_string())
}

#[tokio::test]
async fn test_destroy_stops_when_finalizers_keep_allocating() {
    let (channel, recorder) = standard(true);
    let mut ctx = channel.context();
    let first = ctx.allocate(ty(&channel, "void*"));
    ctx.set_finalizer(&first, Release::custom(regrow)).unwrap();

    let err = ctx.destroy().unwrap_err();
    assert_eq!(err.failures.len(), 1);
    let (last, reason) = &err.failures[0];
    assert_eq!(*last, first.id() + context::TEARDOWN_PASSES as u32);
    assert!(reason.contains("skipped"));
    assert_eq!(channel.live_handles(), 0);

    channel.commit(&[], |_| {}).await.unwrap();
    let destroyed: Vec<u32> = recorder
        .last()
        .commands
        .iter()
        .filter(|c| c.name == "*destroyHandles")
        .flat_map(|c| c.handle_args().collect::<Vec<_>>())
        .collect();
    assert_eq!(destroyed.len(), context::TEARDOWN_PASSES + 1);
}

#[tokio::test]
async fn test_finalizer_at_most_once_per_root() {
    let (channel, _recorder) = standard(true);
    let mut ctx = channel.context();
    let p = ctx.malloc_scoped(8).unwrap();
    let err = ctx.set_finalizer(&p.cast(ty(&channel, "int32*")), Release::call("free")).unwrap_err();
    assert_eq!(err, CallError::Handle(handles::Error::FinalizerAlreadySet(p.id())));
    ctx.destroy().unwrap();
}

#[tokio::test]
async fn test_malloc_typed_casts_without_new_id() {
    let (channel, recorder) = standard(true);
    let mut ctx = channel.context();
    let int32 = ty(&channel, "int32");
    let p = ctx.malloc_typed(&int32).unwrap();

    assert_eq!(p.ty().to_string(), "int32_t*");
    assert_eq!(p.root().ty().to_string(), "void*");
    assert_eq!(p.root().id(), p.id());
    assert_eq!(ctx.owned(), &[p.id()]);

    ctx.commit(&[], |_| {}).await.unwrap();
    let malloc = &recorder.last().commands[0];
    assert_eq!(malloc.name, "malloc");
    assert_eq!(malloc.args, vec![Value::Int(4)]);
    ctx.destroy().unwrap();
}

#[tokio::test]
async fn test_contexts_release_only_their_handles() {
    let (channel, _recorder) = standard(true);
    let mut a = channel.context();
    let mut b = channel.context();
    let pa = a.malloc_scoped(4).unwrap();
    let pb = b.malloc_scoped(4).unwrap();

    // Handles may be passed across contexts.
    b.call("free", &[(&pa).into()]).unwrap();

    b.release(&[pa.clone()]).unwrap();
    assert_eq!(channel.live_handles(), 2);

    a.destroy().unwrap();
    assert_eq!(channel.live_handles(), 1);
    assert_eq!(b.owned(), &[pb.id()]);
    b.destroy().unwrap();
    assert_eq!(channel.live_handles(), 0);
}

// ============================================================================
//  6. STRUCT FIELDS
// ============================================================================

struct Shapes {
    point: TypeRef,
}

fn with_point() -> (TypeRegistry, Shapes) {
    let (mut reg, b): (TypeRegistry, Builtins) = standard_registry();
    let point = reg.register_struct(1000, "Point", 16, vec![
        Field::new("x", b.int32.clone(), 0),
        Field::new("y", b.int32.clone(), 4),
        Field::new("label", b.char_ptr.clone(), 8),
    ]);
    reg.register_pointer(1001, "Point*", &point);
    (reg, Shapes { point })
}

#[tokio::test]
async fn test_set_and_get_scalar_field() {
    let (reg, shapes) = with_point();
    let (channel, recorder) = open(reg, true);
    let mut ctx = channel.context();

    let p = ctx.malloc_typed(&shapes.point).unwrap();
    ctx.set_field(&p, "y", 5).unwrap();
    let y = ctx.get_field(&p, "y").unwrap();
    assert_eq!(y.ty().to_string(), "int32_t");
    ctx.commit(&[y], |_| {}).await.unwrap();

    let registry = channel.registry();
    let int32_ptr = registry.by_name("int32*").unwrap();
    let set_sig = registry.function("set").unwrap().by_first_param(int32_ptr).unwrap().id;
    let get_sig = registry.function("get").unwrap().by_first_param(int32_ptr).unwrap().id;

    let frame = recorder.last();
    let names: Vec<&str> = frame.commands.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["malloc", "add", "set", "add", "get"]);
    assert_eq!(frame.commands[1].args[1], Value::Int(4));
    assert_eq!(frame.commands[2].signature_id, set_sig);
    assert_eq!(frame.commands[2].args[1], Value::Int(5));
    assert_eq!(frame.commands[4].signature_id, get_sig);
    ctx.destroy().unwrap();
}

#[tokio::test]
async fn test_pointer_field_goes_through_void_slot() {
    let (reg, shapes) = with_point();
    let (channel, recorder) = open(reg, true);
    let mut ctx = channel.context();

    let p = ctx.malloc_typed(&shapes.point).unwrap();
    let label = ctx.get_field(&p, "label").unwrap();
    assert_eq!(label.ty().to_string(), "char*");
    ctx.set_field(&p, "label", Value::Null).unwrap();
    ctx.commit(&[], |_| {}).await.unwrap();

    let registry = channel.registry();
    let void_ptr_ptr = registry.by_name("void**").unwrap();
    let get_sig = registry.function("get").unwrap().by_first_param(void_ptr_ptr).unwrap().id;
    let frame = recorder.last();
    assert_eq!(frame.commands[2].name, "get");
    assert_eq!(frame.commands[2].signature_id, get_sig);
    assert_eq!(frame.commands[1].args[1], Value::Int(8));
    ctx.destroy().unwrap();
}

#[tokio::test]
async fn test_field_errors() {
    let (reg, shapes) = with_point();
    let (channel, _recorder) = open(reg, true);
    let mut ctx = channel.context();
    let p = ctx.malloc_typed(&shapes.point).unwrap();

    let err = ctx.get_field(&p, "z").unwrap_err();
    assert!(matches!(err, CallError::UnknownField { ref field, .. } if field == "z"));

    let raw = ctx.malloc_scoped(4).unwrap();
    assert!(matches!(ctx.get_field(&raw, "x"), Err(CallError::NotAStructPointer(_))));
    ctx.destroy().unwrap();
}
