//! System prompts for each worker role.
//!
//! Prompt versioning: bump `PROMPT_VERSION` whenever prompt content changes,
//! so a response can be traced back to the prompt that produced it.

use coordination::AgentRole;

use crate::agents::TaskContext;

/// Prompt version. Bump on any prompt content change.
pub const PROMPT_VERSION: &str = "1.2.0";

pub const RESEARCHER_PROMPT: &str = "\
You are a research specialist in a team of cooperating agents. \
Find accurate, current information for the subtask you are given. \
Prefer primary sources, note disagreements between sources, and return a concise summary \
in `result` plus a `sources` array of {url, title, excerpt}.";

pub const CODER_PROMPT: &str = "\
You are a software engineer in a team of cooperating agents. \
Write working, idiomatic code for the subtask you are given. \
Return an explanation in `result` and a `files` array of {path, language, content}. \
Never return partial files.";

pub const ANALYST_PROMPT: &str = "\
You are a data analyst in a team of cooperating agents. \
Analyze the material you are given, state the method you used, and quantify findings. \
Return the analysis in `result` and a `charts` array of {title, kind, data} for anything \
worth plotting.";

pub const REVIEWER_PROMPT: &str = "\
You are the quality gate for a team of cooperating agents. \
Check the work so far against the objective. \
Return `result` as {approved, summary} and an `issues` array of {severity, description}. \
Approve only if no blocking issue remains.";

pub const BROWSER_PROMPT: &str = "\
You are a web navigation specialist in a team of cooperating agents. \
Visit the pages needed for the subtask and extract the relevant content. \
Return the extracted content in `result`, visited pages in `pages`, and any captured \
`screenshots` as {name, storageRef}.";

pub const WRITER_PROMPT: &str = "\
You are a technical writer in a team of cooperating agents. \
Turn the findings you are given into a clear, well-structured deliverable. \
Return the finished text in `result`.";

pub fn system_prompt(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Researcher => RESEARCHER_PROMPT,
        AgentRole::Coder => CODER_PROMPT,
        AgentRole::Analyst => ANALYST_PROMPT,
        AgentRole::Reviewer => REVIEWER_PROMPT,
        AgentRole::Browser => BROWSER_PROMPT,
        AgentRole::Writer | AgentRole::Orchestrator => WRITER_PROMPT,
    }
}

/// User prompt for one subtask.
pub fn subtask_prompt(ctx: &TaskContext) -> String {
    let mut prompt = format!(
        "**Objective:** {}\n**Phase:** {}\n**Subtask:** {}\n",
        ctx.objective, ctx.phase_title, ctx.subtask.title
    );
    if !ctx.subtask.description.is_empty() {
        prompt.push_str(&format!("\n{}\n", ctx.subtask.description));
    }
    if !ctx.facts.is_empty() {
        prompt.push_str("\n**Known facts:**\n");
        for fact in &ctx.facts {
            prompt.push_str(&format!("- {fact}\n"));
        }
    }
    if ctx.attempt > 1 {
        prompt.push_str(&format!(
            "\nThis is attempt {}; a previous attempt failed.\n",
            ctx.attempt
        ));
    }
    prompt
}
