//! Built-in slash commands.

use crate::config::RuntimeConfig;
use crate::session::state::SessionState;

/// A recognised command, parsed from a leading-slash message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Clear,
    Recover,
    Debug,
    /// Any other `/name args` message; rewritten for the chat loop.
    Other {
        name: String,
        args: String,
    },
}

/// Parse a message into a command. Returns None unless the text starts
/// with `/`.
pub fn parse(text: &str) -> Option<Command> {
    let trimmed = text.trim();
    let rest = trimmed.strip_prefix('/')?;

    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };

    Some(match name {
        "start" => Command::Start,
        "help" => Command::Help,
        "clear" => Command::Clear,
        "recover" => Command::Recover,
        "debug" => Command::Debug,
        other => Command::Other {
            name: other.to_string(),
            args: args.to_string(),
        },
    })
}

/// Rewrite an unrecognised command for the chat loop.
pub fn rewrite_other(name: &str, args: &str) -> String {
    if args.is_empty() {
        format!("{name}:")
    } else {
        format!("{name}: {args}")
    }
}

pub const WELCOME_MESSAGE: &str = "Hi! I'm an assistant bot. Send me a message and I'll reply. \
Use /help to see what I can do.";

pub const HELP_MESSAGE: &str = "Available commands:\n\
/start — welcome message\n\
/help — this message\n\
/clear — forget the conversation history\n\
/recover — unwedge a stuck request without losing history\n\
Anything else is answered by the assistant.";

pub const CLEARED_MESSAGE: &str = "Conversation history cleared.";

pub const RECOVERED_MESSAGE: &str = "Pending work cleared. History is untouched.";

pub const ADMIN_ONLY_MESSAGE: &str = "That command is only available to admins.";

/// Formatted session and config dump for `/debug` (admin only).
pub fn render_debug(state: &SessionState, config: &RuntimeConfig) -> String {
    let batch_line = |label: &str, batch: &Option<crate::session::state::Batch>| match batch {
        Some(batch) => format!(
            "{label}: {} ({:?}, {} messages, {} retries)\n",
            batch.batch_id,
            batch.status,
            batch.pending_messages.len(),
            batch.retry_count
        ),
        None => format!("{label}: none\n"),
    };

    let mut output = String::new();
    output.push_str(&format!(
        "session: user={} chat={}\n",
        state.user_id, state.chat_id
    ));
    output.push_str(&format!(
        "history: {} messages (cap {})\n",
        state.messages.len(),
        config.limits.max_history
    ));
    output.push_str(&batch_line("active batch", &state.active_batch));
    output.push_str(&batch_line("pending batch", &state.pending_batch));
    output.push_str(&format!(
        "workflows in flight: {}\n",
        state.active_workflows.len()
    ));
    output.push_str(&format!(
        "dedup window: {} request ids\n",
        state.processed_request_ids.len()
    ));
    output.push_str(&format!(
        "retry policy: max {} base {:?} backoff {}\n",
        config.retry.max_retries, config.retry.base_delay, config.retry.backoff
    ));
    output.push_str(&format!(
        "timing: rotation {:?} heartbeat {:?} ceiling {:?}",
        config.timing.rotation_interval,
        config.timing.heartbeat_timeout,
        config.timing.hard_ceiling
    ));
    output
}
