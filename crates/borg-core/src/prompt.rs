use crate::types::{Message, Task};

/// Which persona a pipeline phase runs under. Each persona gets a distinct
/// system preamble; the underlying agent binary and sandbox are identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persona {
    /// `backlog -> spec`: breaks a task description into an implementation plan.
    Manager,
    /// `spec -> qa`: turns the plan into acceptance criteria / edge cases.
    Qa,
    /// `qa|qa_fix|retry|rebase -> impl`: writes the actual diff.
    Worker,
}

impl Persona {
    fn preamble(self) -> &'static str {
        match self {
            Persona::Manager => {
                "You are the manager agent in an automated software pipeline. \
                 Read the task description and produce a concise implementation plan: \
                 what files change, what the acceptance criteria are, and any open \
                 risks. Do not write code yet."
            }
            Persona::Qa => {
                "You are the QA agent in an automated software pipeline. Given the \
                 implementation plan below, write the acceptance criteria and edge \
                 cases a correct implementation must satisfy. Do not write code."
            }
            Persona::Worker => {
                "You are the worker agent in an automated software pipeline. \
                 Implement the plan and acceptance criteria below against the \
                 current repository. Make the smallest correct change; run and fix \
                 tests if a test command is available."
            }
        }
    }
}

/// Builds the prompt for a pipeline phase: persona preamble, task context,
/// the previous phase's output (spec/qa context), and the last error on a
/// retry. All pipeline phases share this builder so prompt shape stays
/// consistent across the lifecycle.
pub fn build_phase_instruction(
    persona: Persona,
    task: &Task,
    prior_output: &str,
    file_listing: Option<&str>,
) -> String {
    let mut s = String::new();
    s.push_str(persona.preamble());
    s.push_str("\n\n---\n\n");

    s.push_str(&format!("Task: {}\n\n{}\n\n", task.title, task.description));

    if !prior_output.is_empty() {
        s.push_str("---\n\nPrevious phase output:\n\n");
        s.push_str(prior_output);
        s.push_str("\n\n");
    }

    if let Some(files) = file_listing.filter(|f| !f.is_empty()) {
        s.push_str("---\n\nFiles in repository:\n```\n");
        s.push_str(files);
        s.push_str("\n```\n\n");
    }

    if !task.last_error.is_empty() {
        s.push_str("---\n\nThe previous attempt failed with:\n\n");
        s.push_str(&task.last_error);
        s.push_str("\n\nAddress this before proceeding.\n");
    }

    s
}

/// Builds the prompt for a chat-conversation agent: assistant persona
/// preamble, a short API reference for the dashboard, then the last N
/// messages of the conversation in chronological order.
pub fn build_chat_instruction(assistant_name: &str, messages: &[Message]) -> String {
    let mut s = String::new();
    s.push_str(&format!(
        "You are {assistant_name}, a helpful assistant reachable from Telegram, \
         Discord, WhatsApp, and a web dashboard. Reply conversationally and \
         concisely. You have access to a pipeline dashboard the user may ask \
         about; task status values are backlog, spec, qa, qa_fix, impl, rebase, \
         retry, test, done, merged, failed.\n\n---\n\nConversation so far:\n\n"
    ));

    for msg in messages {
        let who = if msg.is_bot_reply { assistant_name } else { msg.sender_display.as_str() };
        s.push_str(&format!("[{who}]: {}\n", msg.body));
    }

    s
}
