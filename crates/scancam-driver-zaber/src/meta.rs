//! Scripted command sequences.
//!
//! A [`MetaCommand`] is an ordered list of commands with a repeat count.
//! Sequences compose by appending one to another; expansion is a plain loop
//! that produces the flat list of queue entries.
//!
//! In stepped mode a step only waits for `step()` when it is marked with
//! [`pause`](MetaCommand::pause). The final entry of an expanded sequence
//! always pauses, so a whole sequence advances as one step unless it says
//! otherwise.

use crate::protocol::{BaseCommand, CommandKind, MoveCommand};

/// One entry of a sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetaStep {
    /// Command to queue
    pub kind: CommandKind,
    /// Argument; physical units for moves, raw data otherwise
    pub arg: f64,
    /// Wait for `step()` after this command completes
    pub pause_after: bool,
}

/// A named, repeatable command sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaCommand {
    name: String,
    steps: Vec<MetaStep>,
    repeat: u32,
}

impl MetaCommand {
    /// Empty sequence that runs once.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            repeat: 1,
        }
    }

    /// Sequence name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Steps of one iteration.
    pub fn steps(&self) -> &[MetaStep] {
        &self.steps
    }

    /// Number of iterations.
    pub fn repeat_count(&self) -> u32 {
        self.repeat
    }

    /// Append a command.
    pub fn then(mut self, kind: CommandKind, arg: f64) -> Self {
        self.steps.push(MetaStep {
            kind,
            arg,
            pause_after: false,
        });
        self
    }

    /// Append a move.
    pub fn then_move(self, kind: MoveCommand, value: f64) -> Self {
        self.then(CommandKind::Move(kind), value)
    }

    /// Append a base command.
    pub fn then_base(self, command: BaseCommand, data: i32) -> Self {
        self.then(CommandKind::Base(command), f64::from(data))
    }

    /// Pause after the most recently added step.
    pub fn pause(mut self) -> Self {
        if let Some(last) = self.steps.last_mut() {
            last.pause_after = true;
        }
        self
    }

    /// Append every iteration of another sequence.
    pub fn append(mut self, other: &MetaCommand) -> Self {
        self.steps.extend(other.expand());
        self
    }

    /// Run the sequence `times` times in total.
    pub fn repeat(mut self, times: u32) -> Self {
        self.repeat = times;
        self
    }

    /// Flatten into queue entries.
    pub fn expand(&self) -> Vec<MetaStep> {
        let mut out = Vec::with_capacity(self.steps.len() * self.repeat as usize);
        for _ in 0..self.repeat {
            out.extend(self.steps.iter().copied());
        }
        if let Some(last) = out.last_mut() {
            last.pause_after = true;
        }
        out
    }
}
