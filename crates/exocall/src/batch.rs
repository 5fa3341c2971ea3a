//! The ordered list of commands waiting for the next commit.

use neotype::DESTROY_HANDLES;
use neotype::FunctionSignature;
use neowire::Command;

use crate::handles::HandleId;
use crate::resolve::Arg;

#[derive(Debug, Default)]
pub struct Batch {
    commands: Vec<Command>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Empties the batch, returning its commands in enqueue order.
    pub fn take(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }
}

/// Builds the command for a resolved call. `result` is 0 for void calls.
pub fn call_command(sig: &FunctionSignature, args: &[Arg], result: HandleId) -> Command {
    let mut command = Command::new(sig.name.clone(), sig.id, result);
    for arg in args {
        match arg {
            Arg::Handle(h) => command.push_handle(h.id()),
            Arg::Value(v) => command.push_value(v.clone()),
        }
    }
    command
}

/// Tells the peer to drop the values behind `ids`.
pub fn destroy_command(ids: &[HandleId]) -> Command {
    let mut command = Command::new(DESTROY_HANDLES, 0, 0);
    for id in ids {
        command.push_handle(*id);
    }
    command
}
