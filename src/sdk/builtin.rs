//! The fixed tool set backed by the capability providers.

use schemars::JsonSchema;
use serde::Deserialize;

use super::tools::{ToolRegistry, ToolReply};
use crate::error::ToolError;
use crate::providers::Capabilities;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListFilesArgs {}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReadFileArgs {
    /// Name of a file in the connected directory.
    pub filename: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WriteFileArgs {
    /// Name of the file to create or overwrite.
    pub filename: String,
    /// Full text content to write.
    pub content: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEventArgs {
    /// Short description of the reminder.
    pub title: String,
    /// When to fire, as an ISO 8601 timestamp.
    pub iso_time: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListEventsArgs {}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DeleteEventArgs {
    /// Event id, or part of its title.
    pub identifier: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchWebArgs {
    pub query: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct OpenUrlArgs {
    pub url: String,
}

impl ToolRegistry {
    /// Registry holding the file, scheduler and navigation tools.
    #[must_use]
    pub fn builtin(caps: &Capabilities) -> Self {
        let mut tools = Self::new();
        register_file_tools(&mut tools, caps);
        register_scheduler_tools(&mut tools, caps);
        register_navigation_tools(&mut tools, caps);
        tools
    }
}

fn register_file_tools(tools: &mut ToolRegistry, caps: &Capabilities) {
    let files = caps.files.clone();
    tools.tool_with_description(
        "listFiles",
        "List the files in the folder the user connected.",
        move |_: ListFilesArgs| {
            let files = files.clone();
            async move {
                let names = files.list_files().await?;
                if names.is_empty() {
                    Ok::<_, ToolError>("The directory is empty.".to_string())
                } else {
                    Ok(names.join("\n"))
                }
            }
        },
    );

    let files = caps.files.clone();
    tools.tool_with_description(
        "readFile",
        "Read a text file from the connected folder.",
        move |args: ReadFileArgs| {
            let files = files.clone();
            async move { Ok::<_, ToolError>(files.read_file(&args.filename).await?) }
        },
    );

    let files = caps.files.clone();
    tools.tool_with_description(
        "writeFile",
        "Create or overwrite a text file in the connected folder.",
        move |args: WriteFileArgs| {
            let files = files.clone();
            async move {
                let confirmation = files.write_file(&args.filename, &args.content).await?;
                Ok::<_, ToolError>(ToolReply::with_note(confirmation, format!("[Saved {}]", args.filename)))
            }
        },
    );
}

fn register_scheduler_tools(tools: &mut ToolRegistry, caps: &Capabilities) {
    let scheduler = caps.scheduler.clone();
    tools.tool_with_description(
        "scheduleEvent",
        "Schedule a reminder that rings at the given time.",
        move |args: ScheduleEventArgs| {
            let scheduler = scheduler.clone();
            async move { Ok::<_, ToolError>(scheduler.schedule_event(&args.title, &args.iso_time)?) }
        },
    );

    let scheduler = caps.scheduler.clone();
    tools.tool_with_description(
        "listEvents",
        "List scheduled reminders, earliest first.",
        move |_: ListEventsArgs| {
            let scheduler = scheduler.clone();
            async move { Ok::<_, ToolError>(scheduler.list_events()) }
        },
    );

    let scheduler = caps.scheduler.clone();
    tools.tool_with_description(
        "deleteEvent",
        "Delete a reminder by id or by part of its title.",
        move |args: DeleteEventArgs| {
            let scheduler = scheduler.clone();
            async move { Ok::<_, ToolError>(scheduler.delete_event(&args.identifier)?) }
        },
    );
}

fn register_navigation_tools(tools: &mut ToolRegistry, caps: &Capabilities) {
    let navigation = caps.navigation.clone();
    tools.tool_with_description(
        "searchWeb",
        "Open a web search for the query in the user's browser.",
        move |args: SearchWebArgs| {
            let navigation = navigation.clone();
            async move { Ok::<_, ToolError>(navigation.search_web(&args.query).await?.describe()) }
        },
    );

    let navigation = caps.navigation.clone();
    tools.tool_with_description(
        "openUrl",
        "Open a web page in the user's browser.",
        move |args: OpenUrlArgs| {
            let navigation = navigation.clone();
            async move { Ok::<_, ToolError>(navigation.open_url(&args.url).await?.describe()) }
        },
    );
}
