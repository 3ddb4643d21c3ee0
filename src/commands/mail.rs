use std::path::Path;

use clap::Args;
use serde::Serialize;

use super::{OutputFormat, Workspace, print_json};
use crate::error::MailboxError;
use crate::mailbox::{MailboxCounts, Message, NewMessage, View};
use crate::store;

const BUSY_RETRIES: u32 = 5;

#[derive(Debug, Args)]
pub struct SendArgs {
    /// Sending cell
    #[arg(long)]
    pub from: String,
    /// Recipient cell
    #[arg(long)]
    pub to: String,
    #[arg(long, default_value = "")]
    pub subject: String,
    #[arg(long, default_value = "")]
    pub body: String,
    /// Ask the daemon to spawn a worker for the recipient
    #[arg(long)]
    pub dispatch: bool,
    /// Cell the recipient should report back to (default: sender)
    #[arg(long)]
    pub reply_to: Option<String>,
}

impl SendArgs {
    pub fn execute(&self, config_path: Option<&Path>) -> anyhow::Result<()> {
        let workspace = Workspace::open(config_path)?;
        let mailboxes = workspace.mailboxes();
        let message = NewMessage::new(&self.from, &self.to, &self.subject, &self.body)
            .dispatch(self.dispatch)
            .reply_to(self.reply_to.clone());
        let id = store::retry_transient(BUSY_RETRIES, MailboxError::is_transient, || {
            mailboxes.deliver(message.clone())
        })?;
        println!("{id}");
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct InboxArgs {
    /// Cell name
    pub cell: String,
    /// Which view to list
    #[arg(long, value_enum, default_value_t = View::Inbox)]
    pub view: View,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Serialize)]
struct InboxReport<'a> {
    cell: &'a str,
    counts: MailboxCounts,
    messages: Vec<Message>,
}

impl InboxArgs {
    pub fn execute(&self, config_path: Option<&Path>) -> anyhow::Result<()> {
        let workspace = Workspace::open(config_path)?;
        let mailboxes = workspace.mailboxes();
        let report = InboxReport {
            cell: &self.cell,
            counts: mailboxes.counts(&self.cell)?,
            messages: mailboxes.list(&self.cell, self.view)?,
        };

        match OutputFormat::resolve(self.format) {
            OutputFormat::Json => print_json(&report)?,
            OutputFormat::Pretty => {
                let c = &report.counts;
                println!(
                    "=== {} ({:?}) ===  unread {}, opened {}, dispatching {}, closed {}\n",
                    report.cell, self.view, c.unread, c.opened, c.dispatching, c.closed
                );
                if report.messages.is_empty() {
                    println!("  (empty)");
                }
                for m in &report.messages {
                    let flag = if m.dispatch_requested { " [dispatch]" } else { "" };
                    println!(
                        "  #{:<4} {:<12} {:<20} {}{flag}",
                        m.id,
                        m.status.as_str(),
                        peer(m, self.view),
                        m.subject
                    );
                }
            }
            OutputFormat::Text => {
                for m in &report.messages {
                    println!(
                        "message  id={}  status={}  from={}  to={}  dispatch={}  subject={}",
                        m.id, m.status, m.from_cell, m.to_cell, m.dispatch_requested, m.subject
                    );
                }
            }
        }
        Ok(())
    }
}

fn peer(m: &Message, view: View) -> String {
    match view {
        View::Sent => format!("to {}", m.to_cell),
        View::Inbox | View::Archive => format!("from {}", m.from_cell),
    }
}

#[derive(Debug, Args)]
pub struct MessageArgs {
    /// Cell name
    pub cell: String,
    /// Message id
    pub id: u64,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

impl MessageArgs {
    /// Show a message, marking it opened if it was unread.
    pub fn read(&self, config_path: Option<&Path>) -> anyhow::Result<()> {
        let workspace = Workspace::open(config_path)?;
        let mailboxes = workspace.mailboxes();
        let message = store::retry_transient(BUSY_RETRIES, MailboxError::is_transient, || {
            mailboxes.read(&self.cell, self.id)
        })?;
        print_message(&message, OutputFormat::resolve(self.format))
    }

    pub fn archive(&self, config_path: Option<&Path>) -> anyhow::Result<()> {
        let workspace = Workspace::open(config_path)?;
        let mailboxes = workspace.mailboxes();
        let message = store::retry_transient(BUSY_RETRIES, MailboxError::is_transient, || {
            mailboxes.archive(&self.cell, self.id)
        })?;
        match OutputFormat::resolve(self.format) {
            OutputFormat::Json => print_json(&message)?,
            OutputFormat::Pretty | OutputFormat::Text => {
                println!("archived {} #{}", message.to_cell, message.id);
            }
        }
        Ok(())
    }
}

fn print_message(m: &Message, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(m)?,
        OutputFormat::Pretty | OutputFormat::Text => {
            println!("#{} from {} to {} [{}]", m.id, m.from_cell, m.to_cell, m.status);
            println!("Date: {}", m.created_at.to_rfc3339());
            if let Some(reply_to) = &m.reply_to_cell {
                println!("Reply-To: {reply_to}");
            }
            if m.dispatch_requested {
                println!("Dispatch: requested (attempts: {})", m.dispatch_attempts);
            }
            if let Some(failure) = &m.failure {
                println!("Failure: {failure}");
            }
            println!("Subject: {}\n", m.subject);
            println!("{}", m.body);
        }
    }
    Ok(())
}
