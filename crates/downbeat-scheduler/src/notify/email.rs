//! SMTP summary emails.
//!
//! Sent per user during idle housekeeping, listing successes and
//! failures with processing durations. Transport security follows the
//! port: implicit TLS on 465, STARTTLS on 587, plain otherwise. The
//! recipient is the user's first configured address; users can opt out.

use chrono::DateTime;
use downbeat_core::settings::SmtpSettings;
use downbeat_core::task::{TaskRecord, TaskStatus};
use downbeat_core::users::UserProfile;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

pub const SUMMARY_SUBJECT: &str = "下载完成通知";

/// Render one task line's duration, `None` when timestamps are missing
/// or unparseable.
fn duration_line(task: &TaskRecord) -> Option<String> {
    let start = DateTime::parse_from_rfc3339(task.process_start_time.as_deref()?).ok()?;
    let end = DateTime::parse_from_rfc3339(task.process_complete_time.as_deref()?).ok()?;
    let seconds = (end - start).num_seconds().max(0);
    let (hours, minutes, secs) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    Some(if hours > 0 {
        format!("{hours}小时{minutes}分{secs}秒")
    } else {
        format!("{minutes}分{secs}秒")
    })
}

fn push_section(lines: &mut Vec<String>, completed: &[&TaskRecord], title: &str, status: TaskStatus) {
    let tasks: Vec<&&TaskRecord> = completed.iter().filter(|t| t.status == status).collect();
    if tasks.is_empty() {
        lines.push(format!("{title}: 无"));
        return;
    }
    lines.push(format!("{title}:"));
    for (index, task) in tasks.iter().enumerate() {
        lines.push(format!(
            "  {}. [{}] {}",
            index + 1,
            task.type_label(),
            task.display_name()
        ));
        if let Some(duration) = duration_line(task) {
            lines.push(format!("     处理时间: {duration}"));
        }
    }
}

/// Build the summary body for one user's completed tasks.
#[must_use]
pub fn build_summary_body(user: &str, completed: &[&TaskRecord]) -> String {
    let rule = "-".repeat(20);
    let mut lines = vec![
        format!("你好 {user},"),
        "本次任务处理结果如下：".to_string(),
        rule.clone(),
    ];
    push_section(&mut lines, completed, "成功任务", TaskStatus::Finish);
    lines.push(rule.clone());
    push_section(&mut lines, completed, "失败任务", TaskStatus::Error);
    lines.push(rule);
    lines.join("\n")
}

/// Send the summary to the user's first configured address.
pub async fn send_summary_email(
    smtp: &SmtpSettings,
    user: &str,
    profile: &UserProfile,
    body: String,
) {
    if !profile.enable_email_notification {
        tracing::info!(user, "email notifications disabled, skipping summary");
        return;
    }
    let Some(recipient) = profile.email.first().filter(|addr| !addr.is_empty()) else {
        tracing::warn!(user, "no email address configured, skipping summary");
        return;
    };
    if !smtp.is_configured() {
        tracing::error!(user, "SMTP is not configured, cannot send summary");
        return;
    }

    let message = match build_message(smtp, recipient, body) {
        Ok(message) => message,
        Err(e) => {
            tracing::error!(user, error = %e, "could not build summary email");
            return;
        }
    };
    let transport = match build_transport(smtp) {
        Ok(transport) => transport,
        Err(e) => {
            tracing::error!(user, error = %e, "could not build SMTP transport");
            return;
        }
    };

    match transport.send(message).await {
        Ok(_) => tracing::info!(user, recipient, "summary email sent"),
        Err(e) => tracing::error!(user, recipient, error = %e, "summary email failed"),
    }
}

fn build_message(
    smtp: &SmtpSettings,
    recipient: &str,
    body: String,
) -> Result<Message, Box<dyn std::error::Error + Send + Sync>> {
    let from = format!("下载通知 <{}>", smtp.username);
    Ok(Message::builder()
        .from(from.parse()?)
        .to(recipient.parse()?)
        .subject(SUMMARY_SUBJECT)
        .header(ContentType::TEXT_PLAIN)
        .body(body)?)
}

fn build_transport(
    smtp: &SmtpSettings,
) -> Result<AsyncSmtpTransport<Tokio1Executor>, lettre::transport::smtp::Error> {
    let credentials = Credentials::new(smtp.username.clone(), smtp.password.clone());
    let builder = match smtp.smtp_port {
        465 => AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.smtp_server)?,
        587 => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.smtp_server)?,
        _ => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.smtp_server),
    };
    Ok(builder
        .port(smtp.smtp_port)
        .credentials(credentials)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use downbeat_core::link::{LinkInfo, LinkKind};
    use downbeat_core::task::TaskMetadata;

    fn completed_task(name: &str, status: TaskStatus, minutes: i64) -> TaskRecord {
        let mut task = TaskRecord::placeholder(
            "alice",
            "https://music.apple.com/us/album/x/1",
            LinkInfo {
                kind: LinkKind::Album,
                storefront: "us".to_string(),
                id: "1".to_string(),
            },
            "ts",
            0,
            false,
        );
        task.status = status;
        task.metadata = Some(TaskMetadata {
            name: name.to_string(),
            id: "1".to_string(),
            ..TaskMetadata::default()
        });
        task.process_start_time = Some("2026-01-01T10:00:00+08:00".to_string());
        task.process_complete_time =
            Some(format!("2026-01-01T10:{minutes:02}:30+08:00"));
        task
    }

    #[test]
    fn body_lists_successes_and_failures_with_durations() {
        let ok = completed_task("Album A", TaskStatus::Finish, 5);
        let bad = completed_task("Album B", TaskStatus::Error, 1);
        let body = build_summary_body("alice", &[&ok, &bad]);

        assert!(body.starts_with("你好 alice,"));
        assert!(body.contains("成功任务:"));
        assert!(body.contains("1. [专辑] Album A"));
        assert!(body.contains("处理时间: 5分30秒"));
        assert!(body.contains("失败任务:"));
        assert!(body.contains("1. [专辑] Album B"));
        assert!(body.contains("处理时间: 1分30秒"));
    }

    #[test]
    fn empty_sections_say_none() {
        let ok = completed_task("Album A", TaskStatus::Finish, 2);
        let body = build_summary_body("alice", &[&ok]);
        assert!(body.contains("失败任务: 无"));
    }

    #[test]
    fn hour_long_durations_include_hours() {
        let mut task = completed_task("Long", TaskStatus::Finish, 0);
        task.process_complete_time = Some("2026-01-01T11:02:03+08:00".to_string());
        assert_eq!(duration_line(&task).unwrap(), "1小时2分3秒");
    }

    #[test]
    fn missing_timestamps_omit_duration() {
        let mut task = completed_task("X", TaskStatus::Finish, 1);
        task.process_start_time = None;
        assert!(duration_line(&task).is_none());
    }
}
