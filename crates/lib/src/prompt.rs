//! Prompt composer: the instruction text sent to the agent runtime for one turn.
//!
//! Pure and deterministic: the same context always yields the same text.

use crate::confirm::{ConfirmPayload, CONFIRM_PREFIX};

/// Everything the composer needs for one turn.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptContext<'a> {
    /// Output of [`crate::skills::summarize_skills`].
    pub skills_summary: &'a str,
    pub org_id: Option<&'a str>,
    pub confirmed_action_id: Option<&'a str>,
    /// The ledger entry for the confirmed id, when one was recorded.
    pub confirmed_action: Option<&'a ConfirmPayload>,
    pub message: &'a str,
}

const PREAMBLE: &str = "You are a helpful AI assistant for PLG Lead Sourcer.";
const READ_WRITE_CONTRACT: &str =
    "You must only use the REST API endpoints listed below. Never access the database directly.";
const CREDENTIALS: &str = "You have a valid API bearer token and optional org ID provided outside the model. Use the REST API for all data access.";
const RESPONSE_FORMATS: &str = "Respond with raw JSON only (no markdown fences).\n\
Message: {\"type\":\"message\",\"text\":\"markdown allowed\"}\n\
Confirmation: {\"type\":\"confirm\",\"id\":\"action_id\",\"title\":\"...\",\"summary\":\"...\",\"method\":\"POST|PUT|DELETE\",\"path\":\"/api/...\",\"body\":{...}}";

pub fn compose_prompt(ctx: &PromptContext<'_>) -> String {
    let mut out = String::new();
    push_line(&mut out, PREAMBLE);
    push_line(&mut out, READ_WRITE_CONTRACT);
    push_line(&mut out, "Available skills and endpoints:");
    let skills = ctx.skills_summary.trim();
    push_line(
        &mut out,
        if skills.is_empty() {
            "No skills available."
        } else {
            skills
        },
    );
    push_line(&mut out, CREDENTIALS);
    push_line(
        &mut out,
        "For any write action (POST, PUT, DELETE), you MUST request confirmation first by responding with {\"type\":\"confirm\",...} as your final message.",
    );
    push_line(
        &mut out,
        &format!(
            "Do not perform write actions until the user sends {} <id>.",
            CONFIRM_PREFIX
        ),
    );

    match ctx.confirmed_action_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => {
            push_line(
                &mut out,
                &format!(
                    "User has confirmed action id: {}. Proceed with ONLY that action.",
                    id
                ),
            );
            if let Some(action) = ctx.confirmed_action {
                push_line(&mut out, &confirmed_action_line(action));
            }
        }
        None => push_line(&mut out, "No action has been confirmed yet."),
    }

    match ctx.org_id.map(str::trim).filter(|o| !o.is_empty()) {
        Some(org) => push_line(&mut out, &format!("Active org: {}", org)),
        None => push_line(&mut out, "Active org: (none)"),
    }

    out.push('\n');
    push_line(&mut out, RESPONSE_FORMATS);
    out.push('\n');
    out.push_str("User message:\n");
    out.push_str(ctx.message.trim());
    out
}

/// Restates the approved action so the agent executes exactly what was shown to the user.
fn confirmed_action_line(action: &ConfirmPayload) -> String {
    let mut line = format!(
        "Confirmed action: {} {}",
        action.method.as_deref().unwrap_or("?"),
        action.target.as_deref().unwrap_or("?")
    );
    if let Some(body) = &action.body {
        line.push_str(" with body ");
        line.push_str(&body.to_string());
    }
    line
}

fn push_line(out: &mut String, line: &str) {
    out.push_str(line);
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unconfirmed_prompt() {
        let p = compose_prompt(&PromptContext {
            skills_summary: "- projects: Read: GET /api/projects. Write: POST /api/projects. Manage projects",
            message: "  list my projects ",
            ..PromptContext::default()
        });
        assert!(p.starts_with("You are a helpful AI assistant for PLG Lead Sourcer.\n"));
        assert!(p.contains("Never access the database directly."));
        assert!(p.contains("- projects: Read: GET /api/projects."));
        assert!(p.contains("No action has been confirmed yet."));
        assert!(p.contains("Active org: (none)"));
        assert!(p.contains("CONFIRM_ACTION: <id>"));
        assert!(p.ends_with("User message:\nlist my projects"));
    }

    #[test]
    fn confirmed_prompt_names_only_that_action() {
        let action = ConfirmPayload {
            action_id: "a1".to_string(),
            title: Some("Delete project".to_string()),
            summary: None,
            method: Some("DELETE".to_string()),
            target: Some("/api/projects/P".to_string()),
            body: Some(json!({"force": true})),
        };
        let p = compose_prompt(&PromptContext {
            skills_summary: "",
            org_id: Some("org-7"),
            confirmed_action_id: Some("a1"),
            confirmed_action: Some(&action),
            message: "CONFIRM_ACTION: a1",
        });
        assert!(p.contains("User has confirmed action id: a1. Proceed with ONLY that action."));
        assert!(p.contains("Confirmed action: DELETE /api/projects/P with body {\"force\":true}"));
        assert!(p.contains("Active org: org-7"));
        assert!(p.contains("No skills available."));
        assert!(!p.contains("No action has been confirmed yet."));
    }

    #[test]
    fn deterministic() {
        let ctx = PromptContext {
            skills_summary: "No skills available.",
            org_id: Some("o"),
            confirmed_action_id: None,
            confirmed_action: None,
            message: "hi",
        };
        assert_eq!(compose_prompt(&ctx), compose_prompt(&ctx));
    }
}
