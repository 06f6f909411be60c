use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::api::{DirectMessage, User};
use crate::dates;
use crate::state::{ConversationIndex, Conversations};

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Copy)]
pub enum JsonFormat {
    Pretty,
    Compact,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    pub message: DirectMessage,
    pub relative_date: String,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageListOutput {
    pub items: Vec<MessageSummary>,
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendListOutput {
    pub friends: Vec<User>,
}

pub fn resolve_json_format(compact: bool) -> JsonFormat {
    if compact {
        JsonFormat::Compact
    } else {
        JsonFormat::Pretty
    }
}

pub fn json_string<T: Serialize + ?Sized>(value: &T, format: JsonFormat) -> Result<String, OutputError> {
    let payload = match format {
        JsonFormat::Pretty => serde_json::to_string_pretty(value)?,
        JsonFormat::Compact => serde_json::to_string(value)?,
    };
    Ok(payload)
}

pub fn print_json<T: Serialize + ?Sized>(value: &T, format: JsonFormat) -> Result<(), OutputError> {
    let payload = json_string(value, format)?;
    println!("{payload}");
    Ok(())
}

pub fn message_summary(message: DirectMessage) -> MessageSummary {
    let relative_date = dates::relative_created_at(message.created_at.as_deref(), Utc::now());
    MessageSummary {
        message,
        relative_date,
    }
}

pub fn build_message_list(messages: Vec<DirectMessage>) -> MessageListOutput {
    MessageListOutput {
        items: messages.into_iter().map(message_summary).collect(),
    }
}

/// Prints the conversation report for the current state of `index`. The
/// lock is only held while copying.
pub async fn render(index: &ConversationIndex) {
    let chats = index.snapshot().await;
    print!("{}", format_report(&chats));
}

pub fn format_report(chats: &Conversations) -> String {
    let mut out = String::from("{\n");
    out.push_str(&format!("\tUser: {}\n", chats.user().screen_name));
    out.push_str("\tChats:\n");
    for chat in chats.iter() {
        out.push_str(&format!("\t\tChatter: {}\n", chat.screen_name));
        out.push_str("\t\tSent: \n");
        for dm in &chat.sent {
            out.push_str(&format!("\t\t\tText: {}\n", dm.text));
        }
        out.push_str("\t\tReceived: \n");
        for dm in &chat.received {
            out.push_str(&format!("\t\t\tText: {}\n", dm.text));
        }
    }
    out.push_str("}\n\n");
    out
}

pub fn print_messages(
    output: &MessageListOutput,
    json: bool,
    json_format: JsonFormat,
) -> Result<(), OutputError> {
    if json {
        return print_json(output, json_format);
    }

    let mut from_width = display_width("from");
    let mut to_width = display_width("to");
    let mut when_width = display_width("when");
    for item in &output.items {
        from_width = from_width.max(display_width(&item.message.sender_screen_name));
        to_width = to_width.max(display_width(&item.message.recipient_screen_name));
        when_width = when_width.max(display_width(&item.relative_date));
    }
    from_width = from_width.min(18);
    to_width = to_width.min(18);
    when_width = when_width.min(10);

    println!(
        "{}  {}  {}  {}  {}",
        pad_left("id", 20),
        pad_right("when", when_width),
        pad_right("from", from_width),
        pad_right("to", to_width),
        pad_right("text", 72),
    );
    for item in &output.items {
        let text = truncate_display(&normalize_preview_text(&item.message.text), 72);
        println!(
            "{}  {}  {}  {}  {}",
            pad_left(&item.message.id.to_string(), 20),
            pad_right(&item.relative_date, when_width),
            pad_right(&truncate_display(&item.message.sender_screen_name, from_width), from_width),
            pad_right(&truncate_display(&item.message.recipient_screen_name, to_width), to_width),
            pad_right(&text, 72),
        );
    }
    Ok(())
}

pub fn print_message_detail(
    summary: &MessageSummary,
    json: bool,
    json_format: JsonFormat,
) -> Result<(), OutputError> {
    if json {
        return print_json(summary, json_format);
    }

    let message = &summary.message;
    println!("id:    {}", message.id);
    println!("from:  @{} ({})", message.sender_screen_name, message.sender_id);
    println!("to:    @{} ({})", message.recipient_screen_name, message.recipient_id);
    if let Some(created_at) = message.created_at.as_deref() {
        println!("sent:  {} ({})", created_at, summary.relative_date);
    }
    println!();
    println!("{}", message.text);
    Ok(())
}

pub fn print_friends(
    output: &FriendListOutput,
    json: bool,
    json_format: JsonFormat,
) -> Result<(), OutputError> {
    if json {
        return print_json(output, json_format);
    }

    let mut handle_width = display_width("handle");
    let mut name_width = display_width("name");
    for user in &output.friends {
        handle_width = handle_width.max(display_width(&user.screen_name) + 1);
        name_width = name_width.max(display_width(&user.name));
    }
    handle_width = handle_width.min(20);
    name_width = name_width.min(32);

    println!(
        "{}  {}  {}",
        pad_left("id", 20),
        pad_right("handle", handle_width),
        pad_right("name", name_width),
    );
    for user in &output.friends {
        let handle = format!("@{}", user.screen_name);
        println!(
            "{}  {}  {}",
            pad_left(&user.id.to_string(), 20),
            pad_right(&truncate_display(&handle, handle_width), handle_width),
            pad_right(&truncate_display(&user.name, name_width), name_width),
        );
    }
    Ok(())
}

fn normalize_preview_text(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn display_width(value: &str) -> usize {
    UnicodeWidthStr::width(value)
}

fn truncate_display(value: &str, max_width: usize) -> String {
    if display_width(value) <= max_width {
        return value.to_string();
    }
    let ellipsis = "...";
    let mut width = 0usize;
    let mut output = String::new();
    for ch in value.chars() {
        let ch_width = UnicodeWidthChar::width(ch).unwrap_or(0);
        if width + ch_width + ellipsis.len() > max_width {
            break;
        }
        output.push(ch);
        width += ch_width;
    }
    output.push_str(ellipsis);
    output
}

fn pad_right(value: &str, width: usize) -> String {
    let mut output = value.to_string();
    let current = display_width(value);
    if current < width {
        output.push_str(&" ".repeat(width - current));
    }
    output
}

fn pad_left(value: &str, width: usize) -> String {
    let current = display_width(value);
    if current >= width {
        return value.to_string();
    }
    let mut output = " ".repeat(width - current);
    output.push_str(value);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: i64, screen_name: &str) -> User {
        User {
            id,
            screen_name: screen_name.to_string(),
            name: String::new(),
        }
    }

    fn dm(id: i64, sender: &User, recipient: &User, text: &str) -> DirectMessage {
        DirectMessage {
            id,
            sender_id: sender.id,
            sender_screen_name: sender.screen_name.clone(),
            recipient_id: recipient.id,
            recipient_screen_name: recipient.screen_name.clone(),
            text: text.to_string(),
            created_at: None,
        }
    }

    #[test]
    fn report_lists_sent_before_received() {
        let me = user(1, "me");
        let alice = user(2, "alice");
        let mut chats = Conversations::new(me.clone());
        chats.insert(dm(1, &alice, &me, "hello"));
        chats.insert(dm(2, &me, &alice, "hi back"));

        let report = format_report(&chats);
        assert_eq!(
            report,
            "{\n\tUser: me\n\tChats:\n\t\tChatter: alice\n\t\tSent: \n\t\t\tText: hi back\n\t\tReceived: \n\t\t\tText: hello\n}\n\n"
        );
    }

    #[test]
    fn empty_report_still_names_user() {
        let chats = Conversations::new(user(1, "me"));
        assert_eq!(format_report(&chats), "{\n\tUser: me\n\tChats:\n}\n\n");
    }

    #[test]
    fn truncation_respects_display_width() {
        assert_eq!(truncate_display("short", 10), "short");
        assert_eq!(truncate_display("a very long message", 10), "a very ...");
        assert_eq!(display_width("日本"), 4);
        assert_eq!(pad_left("7", 3), "  7");
        assert_eq!(pad_right("ab", 4), "ab  ");
    }

    #[test]
    fn preview_collapses_whitespace() {
        assert_eq!(normalize_preview_text("line one\n\tline  two"), "line one line two");
    }

    #[test]
    fn compact_json_is_single_line() {
        let output = FriendListOutput {
            friends: vec![user(3, "carol")],
        };
        let compact = json_string(&output, resolve_json_format(true)).expect("json");
        assert_eq!(compact, r#"{"friends":[{"id":3,"screen_name":"carol","name":""}]}"#);
        let pretty = json_string(&output, resolve_json_format(false)).expect("json");
        assert!(pretty.contains('\n'));
    }
}
