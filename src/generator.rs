// Copyright 2023-2025 Martin Pool

//! Deterministic command-stream generation from a declarative schema.
//!
//! A scenario is a tree of [Command], [Sequence], and [Choice] nodes that
//! lazily produces command strings for feeding a process under test. Drained
//! through a [ScenarioRunner] with a fixed seed the stream is deterministic,
//! and `reset` restores the whole tree (and the PRNG) so a second draining
//! repeats the first exactly.

use anyhow::{anyhow, Context};
use serde::Deserialize;

use crate::Result;

fn default_repeat() -> u32 {
    1
}

fn default_weight() -> u32 {
    1
}

/// One scenario node as found in a JSON document: an object carrying a
/// `command`, `sequence`, or `choice` key plus the shared options.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NodeSpec {
    Sequence {
        sequence: Vec<NodeSpec>,
        #[serde(default = "default_repeat")]
        repeat: u32,
        #[serde(default = "default_weight")]
        weight: u32,
        #[serde(default)]
        order_rand: bool,
    },
    Choice {
        choice: Vec<NodeSpec>,
        #[serde(default = "default_repeat")]
        repeat: u32,
        #[serde(default = "default_weight")]
        weight: u32,
    },
    Command {
        command: String,
        #[serde(default = "default_repeat")]
        repeat: u32,
        #[serde(default = "default_weight")]
        weight: u32,
    },
}

impl From<NodeSpec> for Scenario {
    fn from(spec: NodeSpec) -> Scenario {
        match spec {
            NodeSpec::Command {
                command,
                repeat,
                weight,
            } => Command::new(&command).repeat(repeat).weight(weight).into(),
            NodeSpec::Sequence {
                sequence,
                repeat,
                weight,
                order_rand,
            } => Sequence::new(sequence.into_iter().map(Scenario::from).collect())
                .repeat(repeat)
                .weight(weight)
                .order_rand(order_rand)
                .into(),
            NodeSpec::Choice {
                choice,
                repeat,
                weight,
            } => Choice::new(choice.into_iter().map(Scenario::from).collect())
                .repeat(repeat)
                .weight(weight)
                .into(),
        }
    }
}

/// A lazy, restartable producer of command strings.
pub enum Scenario {
    Command(Command),
    Sequence(Sequence),
    Choice(Choice),
}

impl Scenario {
    /// Parse a scenario document. A top-level array is accepted as a
    /// single-pass sequence of its members.
    pub fn from_json(json: &str) -> Result<Scenario> {
        let value: serde_json::Value =
            serde_json::from_str(json).context("parse scenario document")?;
        match value {
            serde_json::Value::Array(items) => {
                let children = items
                    .into_iter()
                    .map(|item| {
                        serde_json::from_value::<NodeSpec>(item)
                            .map(Scenario::from)
                            .map_err(|e| anyhow!("unrecognized scenario node: {e}"))
                    })
                    .collect::<Result<Vec<Scenario>>>()?;
                Ok(Sequence::new(children).into())
            }
            other => serde_json::from_value::<NodeSpec>(other)
                .map(Scenario::from)
                .map_err(|e| anyhow!("unrecognized scenario node: {e}")),
        }
    }

    /// Weight as seen by an enclosing [Choice].
    fn weight(&self) -> u32 {
        match self {
            Scenario::Command(n) => n.weight,
            Scenario::Sequence(n) => n.weight,
            Scenario::Choice(n) => n.weight,
        }
    }

    fn next(&mut self, rng: &mut fastrand::Rng) -> Option<String> {
        match self {
            Scenario::Command(n) => n.next(),
            Scenario::Sequence(n) => n.next(rng),
            Scenario::Choice(n) => n.next(rng),
        }
    }

    /// Return the node to its pre-iteration state.
    fn reset(&mut self) {
        match self {
            Scenario::Command(n) => n.current_repeat = 0,
            Scenario::Sequence(n) => {
                n.current_repeat = 0;
                n.current_index = 0;
                n.indexes.clear();
                reset_items(&mut n.items);
            }
            Scenario::Choice(n) => {
                n.current_repeat = 0;
                n.choice = None;
                reset_items(&mut n.items);
            }
        }
    }

    /// Drain this tree deterministically under the given seed.
    pub fn runner(self, seed: u64) -> ScenarioRunner {
        ScenarioRunner {
            root: self,
            rng: fastrand::Rng::with_seed(seed),
            seed,
        }
    }
}

fn reset_items(items: &mut [Scenario]) {
    for item in items {
        item.reset();
    }
}

/// A single command, yielded `repeat` times.
pub struct Command {
    command: String,
    weight: u32,
    repeat: u32,
    current_repeat: u32,
}

impl Command {
    pub fn new(command: &str) -> Command {
        Command {
            command: command.to_owned(),
            weight: 1,
            repeat: 1,
            current_repeat: 0,
        }
    }

    pub fn weight(mut self, weight: u32) -> Command {
        self.weight = weight;
        self
    }

    pub fn repeat(mut self, repeat: u32) -> Command {
        self.repeat = repeat;
        self
    }

    fn next(&mut self) -> Option<String> {
        if self.current_repeat < self.repeat {
            self.current_repeat += 1;
            Some(self.command.clone())
        } else {
            None
        }
    }
}

/// Children drained in order (or a fresh random order per repeat when
/// `order_rand` is set: each repeat still visits every child exactly once).
pub struct Sequence {
    items: Vec<Scenario>,
    weight: u32,
    repeat: u32,
    order_rand: bool,
    current_repeat: u32,
    current_index: usize,
    /// Visit order for the current repeat; empty until first use.
    indexes: Vec<usize>,
}

impl Sequence {
    pub fn new(items: Vec<Scenario>) -> Sequence {
        Sequence {
            items,
            weight: 1,
            repeat: 1,
            order_rand: false,
            current_repeat: 0,
            current_index: 0,
            indexes: Vec::new(),
        }
    }

    pub fn weight(mut self, weight: u32) -> Sequence {
        self.weight = weight;
        self
    }

    pub fn repeat(mut self, repeat: u32) -> Sequence {
        self.repeat = repeat;
        self
    }

    pub fn order_rand(mut self, order_rand: bool) -> Sequence {
        self.order_rand = order_rand;
        self
    }

    fn start_iteration(&mut self, rng: &mut fastrand::Rng) {
        self.indexes = (0..self.items.len()).collect();
        if self.order_rand {
            rng.shuffle(&mut self.indexes);
        }
        // Children must be drainable once per repeat.
        reset_items(&mut self.items);
    }

    fn next(&mut self, rng: &mut fastrand::Rng) -> Option<String> {
        if self.items.is_empty() {
            return None;
        }
        if self.indexes.is_empty() {
            self.start_iteration(rng);
        }
        while self.current_repeat < self.repeat && self.current_index < self.items.len() {
            let item = &mut self.items[self.indexes[self.current_index]];
            if let Some(command) = item.next(rng) {
                return Some(command);
            }
            self.current_index += 1;
            if self.current_index == self.items.len() {
                self.current_index = 0;
                self.current_repeat += 1;
                self.start_iteration(rng);
            }
        }
        None
    }
}

/// One child picked by weight per repeat and drained to exhaustion before
/// the next pick.
pub struct Choice {
    items: Vec<Scenario>,
    weight: u32,
    repeat: u32,
    total_weight: u32,
    current_repeat: u32,
    choice: Option<usize>,
}

impl Choice {
    pub fn new(items: Vec<Scenario>) -> Choice {
        let total_weight = items.iter().map(Scenario::weight).sum();
        Choice {
            items,
            weight: 1,
            repeat: 1,
            total_weight,
            current_repeat: 0,
            choice: None,
        }
    }

    pub fn weight(mut self, weight: u32) -> Choice {
        self.weight = weight;
        self
    }

    pub fn repeat(mut self, repeat: u32) -> Choice {
        self.repeat = repeat;
        self
    }

    fn start_iteration(&mut self, rng: &mut fastrand::Rng) {
        // A uniform draw in [0, total_weight) selects by cumulative weight.
        let mut draw = rng.u32(0..self.total_weight);
        for (idx, item) in self.items.iter().enumerate() {
            if draw < item.weight() {
                self.choice = Some(idx);
                break;
            }
            draw -= item.weight();
        }
        reset_items(&mut self.items);
    }

    fn next(&mut self, rng: &mut fastrand::Rng) -> Option<String> {
        if self.items.is_empty() || self.total_weight == 0 {
            return None;
        }
        loop {
            if self.current_repeat >= self.repeat {
                return None;
            }
            if self.choice.is_none() {
                self.start_iteration(rng);
            }
            let idx = self.choice?;
            if let Some(command) = self.items[idx].next(rng) {
                return Some(command);
            }
            self.current_repeat += 1;
            self.choice = None;
        }
    }
}

impl From<Command> for Scenario {
    fn from(n: Command) -> Scenario {
        Scenario::Command(n)
    }
}

impl From<Sequence> for Scenario {
    fn from(n: Sequence) -> Scenario {
        Scenario::Sequence(n)
    }
}

impl From<Choice> for Scenario {
    fn from(n: Choice) -> Scenario {
        Scenario::Choice(n)
    }
}

/// Owns a scenario tree and the seeded PRNG that drives it.
///
/// `reset` restores both, so two successive drainings produce identical
/// command sequences.
pub struct ScenarioRunner {
    root: Scenario,
    rng: fastrand::Rng,
    seed: u64,
}

impl ScenarioRunner {
    pub fn reset(&mut self) {
        self.root.reset();
        self.rng = fastrand::Rng::with_seed(self.seed);
    }
}

impl Iterator for ScenarioRunner {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.root.next(&mut self.rng)
    }
}
