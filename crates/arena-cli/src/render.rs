use std::collections::BTreeSet;
use std::io::Write;

use arena_stream::{AgentId, SinkEvent};

/// Renders interleaved agent output as prefixed lines on a terminal.
///
/// A new `[agent]` prefix is written whenever the speaking agent changes, so
/// paced chunks from several agents stay readable when mixed on one stream.
#[derive(Default)]
pub struct Console {
    current: Option<AgentId>,
    completed: BTreeSet<AgentId>,
}

impl Console {
    pub fn render(&mut self, event: &SinkEvent, out: &mut impl Write) -> std::io::Result<()> {
        match event {
            SinkEvent::Chunk { agent_id, text } => {
                self.switch_to(agent_id, out)?;
                write!(out, "{text}")?;
            }
            SinkEvent::Error { agent_id, message } => {
                self.break_line(out)?;
                writeln!(out, "[{agent_id}] error: {message}")?;
            }
            SinkEvent::Complete { agent_id } => {
                self.break_line(out)?;
                writeln!(out, "[{agent_id}] done")?;
                self.completed.insert(agent_id.clone());
            }
            SinkEvent::ConnectionState(state) => {
                self.break_line(out)?;
                writeln!(out, "-- {state}")?;
            }
        }
        out.flush()
    }

    pub fn completed(&self) -> &BTreeSet<AgentId> {
        &self.completed
    }

    fn switch_to(&mut self, agent_id: &AgentId, out: &mut impl Write) -> std::io::Result<()> {
        if self.current.as_ref() == Some(agent_id) {
            return Ok(());
        }
        if self.current.is_some() {
            writeln!(out)?;
        }
        write!(out, "[{agent_id}] ")?;
        self.current = Some(agent_id.clone());
        Ok(())
    }

    fn break_line(&mut self, out: &mut impl Write) -> std::io::Result<()> {
        if self.current.take().is_some() {
            writeln!(out)?;
        }
        Ok(())
    }
}
