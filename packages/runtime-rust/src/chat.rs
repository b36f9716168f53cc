//! Console chat service.
//!
//! The first line typed is the user's name; every later line is broadcast as
//! a `message` event, and every `message` event from any chat process is
//! printed as `author: msg`.

use std::sync::Arc;

use ember_core::{field_str, Event, Payload};

use crate::container::{ServiceDefinition, WorkerContext};
use crate::entrypoint::{BroadcastEventEntrypoint, OnceEntrypoint, StdinEntrypoint};
use crate::injection::{
    DispatcherProvider, EventDispatcher, OutputProvider, OutputSink, Session, SessionProvider,
};

/// Service name, also the topic chat messages are published on.
pub const SERVICE_NAME: &str = "chat";
/// Event type of a chat message.
pub const MESSAGE_EVENT: &str = "message";
/// Console prompt.
pub const PROMPT: &str = ">>> ";

const USER: &str = "user";
const STDOUT: &str = "stdout";
const DISPATCH: &str = "dispatch";

/// What a console line means for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdinAction {
    /// The session is not logged in yet: the line is the user's name.
    Login(String),
    /// The line is a message to broadcast.
    Send(String),
}

/// Decides what to do with `line`.
#[must_use]
pub fn route_line(logged_in: bool, line: &str) -> StdinAction {
    if logged_in {
        StdinAction::Send(line.to_string())
    } else {
        StdinAction::Login(line.to_string())
    }
}

/// Greeting printed once the user has logged in.
#[must_use]
pub fn welcome(name: &str) -> String {
    format!("Welcome to chat, {name}!\n")
}

/// Builds the event broadcast for one chat line.
#[must_use]
pub fn message_event(author: &str, msg: &str) -> Event {
    Event::new(MESSAGE_EVENT)
        .with_field("author", author)
        .with_field("msg", msg)
}

/// Renders a received message. Missing or non-text fields render as empty.
#[must_use]
pub fn render_message(payload: &Payload) -> String {
    let author = field_str(payload, "author").unwrap_or_default();
    let msg = field_str(payload, "msg").unwrap_or_default();
    format!("\r{author}: {msg}\n")
}

/// The chat service. All per-user state lives in the `user` session
/// injection, so the service object itself is stateless.
#[derive(Debug, Default)]
pub struct Chat;

impl Chat {
    /// Registration table reading `stdin` and writing to `output`.
    #[must_use]
    pub fn definition(stdin: StdinEntrypoint, output: OutputSink) -> ServiceDefinition<Self> {
        ServiceDefinition::new(SERVICE_NAME, Self)
            .injection(SessionProvider::new(USER))
            .injection(OutputProvider::new(STDOUT, output))
            .injection(DispatcherProvider::new(DISPATCH))
            .method("login", OnceEntrypoint::default(), &[STDOUT], Self::login)
            .method(
                "handle_stdin",
                stdin,
                &[USER, STDOUT, DISPATCH],
                Self::handle_stdin,
            )
            .method(
                "handle_message",
                BroadcastEventEntrypoint::new(SERVICE_NAME, MESSAGE_EVENT),
                &[USER, STDOUT],
                Self::handle_message,
            )
    }

    /// Registration table wired to the process console.
    #[must_use]
    pub fn console() -> ServiceDefinition<Self> {
        Self::definition(StdinEntrypoint::new(), OutputSink::stdout())
    }

    async fn login(self: Arc<Self>, ctx: WorkerContext) -> anyhow::Result<()> {
        let out = ctx.injection::<OutputSink>(STDOUT)?;
        out.write("Please enter your name:\n").await?;
        prompt(&out).await
    }

    async fn handle_stdin(self: Arc<Self>, ctx: WorkerContext) -> anyhow::Result<()> {
        let session = ctx.injection::<Session>(USER)?;
        let line = ctx.args().arg_str(0).unwrap_or_default();

        match route_line(session.is_logged_in(), line) {
            StdinAction::Login(name) => {
                session.login(name.as_str());
                let out = ctx.injection::<OutputSink>(STDOUT)?;
                out.write(&welcome(&name)).await?;
                prompt(&out).await
            }
            StdinAction::Send(msg) => {
                let dispatch = ctx.injection::<EventDispatcher>(DISPATCH)?;
                let author = session.identity().unwrap_or_default();
                dispatch.dispatch(message_event(&author, &msg)).await?;
                Ok(())
            }
        }
    }

    async fn handle_message(self: Arc<Self>, ctx: WorkerContext) -> anyhow::Result<()> {
        let session = ctx.injection::<Session>(USER)?;
        if !session.is_logged_in() {
            return Ok(());
        }

        let out = ctx.injection::<OutputSink>(STDOUT)?;
        let rendered = ctx
            .args()
            .arg_object(0)
            .map(render_message)
            .unwrap_or_else(|| render_message(&Payload::new()));
        out.write(&rendered).await?;
        prompt(&out).await
    }
}

async fn prompt(out: &OutputSink) -> anyhow::Result<()> {
    out.write(PROMPT).await?;
    out.flush().await?;
    Ok(())
}
