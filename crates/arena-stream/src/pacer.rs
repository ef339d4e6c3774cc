//! Per-agent output pacing.
//!
//! [`PaceBuffer`] holds the pure state machine: it decides which prefix of the
//! backlog may be emitted so that no chunk ends inside a word or leaves a fenced
//! code block half-open. [`Pacer`] drives one buffer from its own task with a
//! ticker and reports emissions over a channel tagged with the pacer's epoch.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::agent::AgentId;
use crate::config::PacerConfig;

const FENCE: &str = "```";

/// Something a pacer wants delivered to the rendering sink.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Emission {
    /// A boundary-safe chunk.
    Chunk(String),
    /// The forced final drain (possibly empty), followed by completion.
    Final(String),
}

/// Line/fence state carried across emissions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Carry {
    /// Emitted text ends inside a fenced code block.
    fence_open: bool,
    /// `Some(n)` while the current line holds only `n` spaces.
    indent: Option<usize>,
}

impl Carry {
    const START: Carry = Carry {
        fence_open: false,
        indent: Some(0),
    };
}

/// A whitespace position where the backlog may be cut.
#[derive(Clone, Copy, Debug)]
struct Boundary {
    /// Byte offset just past the whitespace char.
    end: usize,
    /// Chars in the prefix `[..end]`.
    chars: usize,
    carry: Carry,
}

impl Boundary {
    fn fence_safe(&self) -> bool {
        !self.carry.fence_open
    }
}

fn scan(text: &str, start: Carry) -> (Vec<Boundary>, Carry) {
    let mut carry = start;
    let mut boundaries = Vec::new();
    let mut chars = 0_usize;
    let mut skip = 0_usize;
    for (idx, ch) in text.char_indices() {
        chars += 1;
        if skip > 0 {
            skip -= 1;
        } else {
            match ch {
                '\n' => carry.indent = Some(0),
                ' ' => carry.indent = carry.indent.map(|n| n + 1),
                '`' if carry.indent.is_some_and(|n| n <= 3) && text[idx..].starts_with(FENCE) => {
                    carry.fence_open = !carry.fence_open;
                    carry.indent = None;
                    skip = FENCE.len() - 1;
                }
                _ => carry.indent = None,
            }
        }
        if ch.is_whitespace() {
            let end = idx + ch.len_utf8();
            // A `\r` is only a cut point once its `\n` is known not to follow.
            if ch == '\r' && (end == text.len() || text[end..].starts_with('\n')) {
                continue;
            }
            boundaries.push(Boundary { end, chars, carry });
        }
    }
    (boundaries, carry)
}

/// Backlog of one agent's text plus the rules for releasing it.
#[derive(Debug)]
pub struct PaceBuffer {
    chars_per_tick: usize,
    backlog_ceiling: usize,
    backlog: String,
    backlog_chars: usize,
    carry: Carry,
    paused: bool,
    complete: bool,
    finished: bool,
    appended_chars: usize,
    emitted_chars: usize,
}

impl PaceBuffer {
    pub fn new(config: &PacerConfig) -> Self {
        Self {
            chars_per_tick: config.chars_per_tick(),
            backlog_ceiling: config.backlog_ceiling.max(1),
            backlog: String::new(),
            backlog_chars: 0,
            carry: Carry::START,
            paused: false,
            complete: false,
            finished: false,
            appended_chars: 0,
            emitted_chars: 0,
        }
    }

    /// Appends a fragment verbatim. Returns a forced flush when the backlog
    /// exceeds the ceiling.
    pub fn push(&mut self, fragment: &str) -> Option<Emission> {
        if self.complete {
            debug!(
                dropped_chars = fragment.chars().count(),
                "fragment after completion ignored"
            );
            return None;
        }
        let added = fragment.chars().count();
        self.backlog.push_str(fragment);
        self.backlog_chars += added;
        self.appended_chars += added;
        self.enforce_ceiling()
    }

    /// One pacing step: the largest fence-safe whitespace prefix within the
    /// per-tick budget, or the first such prefix if even that exceeds it.
    pub fn tick(&mut self) -> Option<Emission> {
        if self.paused || self.finished || self.backlog.is_empty() {
            return None;
        }
        let (boundaries, _) = scan(&self.backlog, self.carry);
        let mut safe = boundaries.iter().filter(|b| b.fence_safe());
        let within_budget = safe
            .clone()
            .take_while(|b| b.chars <= self.chars_per_tick)
            .last()
            .copied();
        let chosen = within_budget.or_else(|| safe.next().copied())?;
        Some(Emission::Chunk(self.emit(chosen)))
    }

    /// Flags end of input and drains everything unless paused.
    pub fn mark_complete(&mut self) -> Option<Emission> {
        self.complete = true;
        if self.paused || self.finished {
            return None;
        }
        Some(self.drain())
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resumes from the exact backlog state at pause time, applying any
    /// completion or ceiling flush that was held back.
    pub fn resume(&mut self) -> Option<Emission> {
        if !self.paused {
            return None;
        }
        self.paused = false;
        if self.complete && !self.finished {
            return Some(self.drain());
        }
        self.enforce_ceiling()
    }

    /// Drops the backlog without emitting it. Returns the discarded char count.
    pub fn discard(&mut self) -> usize {
        let dropped = self.backlog_chars;
        self.backlog.clear();
        self.backlog_chars = 0;
        self.finished = true;
        dropped
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn backlog_chars(&self) -> usize {
        self.backlog_chars
    }

    pub fn appended_chars(&self) -> usize {
        self.appended_chars
    }

    pub fn emitted_chars(&self) -> usize {
        self.emitted_chars
    }

    fn enforce_ceiling(&mut self) -> Option<Emission> {
        if self.paused || self.backlog_chars <= self.backlog_ceiling {
            return None;
        }
        let total = self.backlog_chars;
        let ceiling = self.backlog_ceiling;
        let (boundaries, end_carry) = scan(&self.backlog, self.carry);
        let fits = |b: &&Boundary| total - b.chars < ceiling;

        let fence_safe = boundaries.iter().rev().find(|b| b.fence_safe()).filter(fits);
        let any_word = boundaries.last().filter(fits);
        let chosen = match (fence_safe, any_word) {
            (Some(b), _) | (None, Some(b)) => *b,
            (None, None) => Boundary {
                end: self.backlog.len(),
                chars: total,
                carry: end_carry,
            },
        };
        trace!(
            backlog_chars = total,
            flushed_chars = chosen.chars,
            "backlog ceiling flush"
        );
        Some(Emission::Chunk(self.emit(chosen)))
    }

    fn drain(&mut self) -> Emission {
        let (_, end_carry) = scan(&self.backlog, self.carry);
        let text = self.emit(Boundary {
            end: self.backlog.len(),
            chars: self.backlog_chars,
            carry: end_carry,
        });
        self.finished = true;
        Emission::Final(text)
    }

    fn emit(&mut self, boundary: Boundary) -> String {
        let rest = self.backlog.split_off(boundary.end);
        let chunk = std::mem::replace(&mut self.backlog, rest);
        self.carry = boundary.carry;
        self.backlog_chars -= boundary.chars;
        self.emitted_chars += boundary.chars;
        chunk
    }
}

/// Emission tagged with the pacer that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacerOutput {
    pub agent_id: AgentId,
    /// Identifies the pacer instance; outputs of destroyed pacers are stale.
    pub epoch: u64,
    pub emission: Emission,
}

#[derive(Debug)]
enum PacerCommand {
    Add(String),
    MarkComplete,
    Pause,
    Resume,
}

/// Handle to one agent's pacing task.
pub struct Pacer {
    agent_id: AgentId,
    epoch: u64,
    tx: mpsc::UnboundedSender<PacerCommand>,
    task: JoinHandle<()>,
}

impl Pacer {
    /// Spawns the pacing task. Emissions go to `out` tagged with `epoch`.
    pub fn spawn(
        agent_id: AgentId,
        epoch: u64,
        config: &PacerConfig,
        out: mpsc::UnboundedSender<PacerOutput>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let buffer = PaceBuffer::new(config);
        let task = tokio::spawn(pacer_task(
            agent_id.clone(),
            epoch,
            buffer,
            config.tick_interval,
            rx,
            out,
        ));
        Self {
            agent_id,
            epoch,
            tx,
            task,
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn add(&self, fragment: impl Into<String>) {
        self.send(PacerCommand::Add(fragment.into()));
    }

    pub fn mark_complete(&self) {
        self.send(PacerCommand::MarkComplete);
    }

    pub fn pause(&self) {
        self.send(PacerCommand::Pause);
    }

    pub fn resume(&self) {
        self.send(PacerCommand::Resume);
    }

    /// Cancels the ticker and releases the backlog without emitting it.
    pub fn destroy(self) {
        self.task.abort();
    }

    fn send(&self, command: PacerCommand) {
        if self.tx.send(command).is_err() {
            trace!(agent_id = %self.agent_id, "pacer task already finished");
        }
    }
}

async fn pacer_task(
    agent_id: AgentId,
    epoch: u64,
    mut buffer: PaceBuffer,
    tick_interval: std::time::Duration,
    mut rx: mpsc::UnboundedReceiver<PacerCommand>,
    out: mpsc::UnboundedSender<PacerOutput>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + tick_interval, tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let emission = tokio::select! {
            biased;
            command = rx.recv() => {
                let Some(command) = command else {
                    let dropped = buffer.discard();
                    debug!(agent_id = %agent_id, dropped, "pacer handle dropped");
                    return;
                };
                match command {
                    PacerCommand::Add(fragment) => buffer.push(&fragment),
                    PacerCommand::MarkComplete => buffer.mark_complete(),
                    PacerCommand::Pause => {
                        buffer.pause();
                        None
                    }
                    PacerCommand::Resume => {
                        ticker.reset();
                        buffer.resume()
                    }
                }
            }
            _ = ticker.tick(), if !buffer.is_paused() => buffer.tick(),
        };

        let Some(emission) = emission else {
            continue;
        };
        let is_final = matches!(emission, Emission::Final(_));
        let delivered = out
            .send(PacerOutput {
                agent_id: agent_id.clone(),
                epoch,
                emission,
            })
            .is_ok();
        if is_final || !delivered {
            debug!(
                agent_id = %agent_id,
                emitted = buffer.emitted_chars(),
                appended = buffer.appended_chars(),
                "pacer finished"
            );
            return;
        }
    }
}
