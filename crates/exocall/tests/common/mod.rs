//! A loopback peer that executes builtin functions over a `QueueTransport`.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use exocall::queue::PeerEnd;
use exocall::queue::QueueTransport;
use exocall::Channel;
use exocall::ChannelBuilder;
use exocall::TransportEvent;
use neotype::TypeRegistry;
use neotype::standard_registry;
use neowire::Command;
use neowire::CommitFrame;
use neowire::LogFrame;
use neowire::ReplyFrame;
use neowire::Value;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// What the peer did, in order. Shared with the test.
pub type Journal = Arc<Mutex<Vec<String>>>;

pub struct LoopbackPeer {
    registry: Arc<TypeRegistry>,
    values: HashMap<u32, Value>,
    memory: HashMap<i64, Value>,
    next_address: i64,
    journal: Journal,
}

impl LoopbackPeer {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self {
            registry,
            values: HashMap::new(),
            memory: HashMap::new(),
            next_address: 0x1000,
            journal: Journal::default(),
        }
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    /// Serves the peer end until the channel side goes away.
    pub async fn serve(mut self, mut end: PeerEnd, announce_ready: bool) {
        let hello = LogFrame { msg: "module loaded.".into() }.encode().unwrap();
        end.reply(hello);
        if announce_ready {
            end.ready();
        }
        while let Some(payload) = end.recv().await {
            let frame = CommitFrame::decode(&payload).expect("peer received a bad frame");
            let reply = self.execute(frame);
            if !end.reply(reply.encode().unwrap()) {
                break;
            }
        }
    }

    fn execute(&mut self, frame: CommitFrame) -> ReplyFrame {
        let mut primitive: HashMap<u32, bool> = HashMap::new();
        for command in &frame.commands {
            let result = self.run(command);
            if command.result_handle_id != 0 {
                let ret_is_primitive = self
                    .registry
                    .get(command.signature_id)
                    .and_then(|ty| ty.as_function().map(|f| f.ret.is_primitive()))
                    .unwrap_or(false);
                primitive.insert(command.result_handle_id, ret_is_primitive);
                self.values.insert(command.result_handle_id, result);
            }
        }

        let values = frame
            .output_handle_ids
            .iter()
            .map(|id| {
                let is_primitive = primitive.get(id).copied().unwrap_or(false);
                match self.values.get(id) {
                    Some(v) if is_primitive => v.clone(),
                    Some(_) => Value::Int((*id).into()),
                    None => Value::Null,
                }
            })
            .collect();
        ReplyFrame::new(frame.correlation_id, values)
    }

    fn arg(&self, command: &Command, index: usize) -> Value {
        let raw = &command.args[index];
        if command.arg_is_handle[index] {
            let id = raw.as_u64().unwrap() as u32;
            self.values.get(&id).cloned().unwrap_or(Value::Null)
        } else {
            raw.clone()
        }
    }

    fn run(&mut self, command: &Command) -> Value {
        let mut journal = self.journal.lock().unwrap();
        match command.name.as_str() {
            "*destroyHandles" => {
                for id in command.handle_args() {
                    self.values.remove(&id);
                    journal.push(format!("destroy {}", id));
                }
                Value::Null
            }
            "malloc" => {
                let size = self.arg(command, 0).as_i64().unwrap();
                let address = self.next_address;
                self.next_address += size.max(8);
                journal.push(format!("malloc {} -> {:#x}", size, address));
                Value::Int(address)
            }
            "free" => {
                let address = self.arg(command, 0).as_i64().unwrap_or(0);
                journal.push(format!("free {:#x}", address));
                Value::Null
            }
            "add" | "sub" => {
                let (a, b) = (self.arg(command, 0), self.arg(command, 1));
                let sign = if command.name == "add" { 1 } else { -1 };
                match (a.as_i64(), b.as_i64()) {
                    (Some(a), Some(b)) => Value::Int(a + sign * b),
                    _ => Value::Float(a.as_f64().unwrap_or(0.0) + sign as f64 * b.as_f64().unwrap_or(0.0)),
                }
            }
            "get" => {
                let address = self.arg(command, 0).as_i64().unwrap_or(0);
                self.memory.get(&address).cloned().unwrap_or(Value::Int(0))
            }
            "set" => {
                let address = self.arg(command, 0).as_i64().unwrap_or(0);
                let value = self.arg(command, 1);
                self.memory.insert(address, value);
                Value::Null
            }
            other => {
                journal.push(format!("unsupported {}", other));
                Value::Null
            }
        }
    }
}

/// A channel wired to a spawned loopback peer. The pump is running.
pub struct Harness {
    pub channel: Channel,
    pub journal: Journal,
    pub events: PeerEvents,
}

/// Lets a test push extra events at the channel after the peer started.
pub struct PeerEvents(tokio::sync::mpsc::UnboundedSender<TransportEvent>);

impl PeerEvents {
    pub fn send(&self, event: TransportEvent) {
        let _ = self.0.send(event);
    }
}

pub fn harness(announce_ready: bool) -> Harness {
    harness_with(standard_registry().0, announce_ready)
}

pub fn harness_with(registry: TypeRegistry, announce_ready: bool) -> Harness {
    init_tracing();
    let registry = Arc::new(registry);
    let (transport, end) = QueueTransport::pair();
    let events = end.sender();

    let peer = LoopbackPeer::new(registry.clone());
    let journal = peer.journal();
    tokio::spawn(peer.serve(end, announce_ready));

    let channel = ChannelBuilder::new()
        .name("loopback")
        .registry(registry)
        .transport(transport)
        .build()
        .unwrap();
    channel.spawn_pump();

    Harness { channel, journal, events: PeerEvents(events) }
}
