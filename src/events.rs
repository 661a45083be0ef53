//! # Session Events
//!
//! Every asynchronous source (device threads, the network task, the playback
//! mixer, the terminal) reports into one queue, and the session handles the
//! entries strictly one at a time. That single consumer is what keeps state
//! transitions and the playback timeline free of interleaving.

use crate::audio::codec::AudioFrame;
use crate::audio::scheduler::UnitId;
use crate::channel::{ChannelEvent, ConnectionId};
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum SessionEvent {
    /// Something the user asked for
    Command(UserCommand),
    /// Lifecycle or message event from a realtime connection
    Channel {
        connection: ConnectionId,
        event: ChannelEvent,
    },
    /// A complete microphone frame from recording number `generation`
    CapturedFrame { generation: u64, frame: AudioFrame },
    /// A scheduled playback unit reached its end
    PlaybackEnded(UnitId),
}

pub type EventSender = mpsc::UnboundedSender<SessionEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Create the session's event queue.
pub fn event_queue() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// User controls exposed by the terminal front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCommand {
    StartRecording,
    StopRecording,
    Reset,
    Quit,
}

impl std::str::FromStr for UserCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "start" | "s" => Ok(UserCommand::StartRecording),
            "stop" | "x" => Ok(UserCommand::StopRecording),
            "reset" | "r" => Ok(UserCommand::Reset),
            "quit" | "q" | "exit" => Ok(UserCommand::Quit),
            _ => Err(format!("Unknown command: {} (try start, stop, reset, quit)", s.trim())),
        }
    }
}
