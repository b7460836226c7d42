use std::collections::{HashMap, HashSet};
use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use mcp_playground::dataset::{DatasetClient, FileDatasets};
use mcp_playground::llm::ProviderRouter;
use mcp_playground::mcp::McpHost;
use mcp_playground::message::{InvocationState, Role};
use mcp_playground::storage::{Storage, get_storage};
use mcp_playground::tab::{TabId, TabState};
use mcp_playground::toolbox::McpToolBox;
use mcp_playground::{Playground, PlaygroundStore, StoreConfig, spawn_persistence};

const HELP: &str = "\
commands:
  <text>                 send a message
  /new [name]            open a tab          /tabs            list tabs
  /switch <n>            switch tab          /close           close tab
  /dup                   duplicate tab       /rename <name>   rename tab
  /undo  /redo           move through history
  /clear                 clear conversation  /stop            stop the model
  /delete <n>            delete message n    /rerun <n>       rerun from message n
  /approve <id>          run a tool call     /reject <id>     deny a tool call
  /auto on|off           auto-approve write tools
  /tools                 list tools          /enable <provider> [tool..]  enable tools
  /system <prompt>       system prompt       /model <name>    model
  /temp <value>          temperature         /steps <n>       max steps per turn
  /cut on|off|<a> <b>    select messages for capture
  /capture <dataset> [name]  save the conversation into a dataset
  /datasets              list datasets       /quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let storage = Arc::new(get_storage().await?);
    let mut settings = storage.load_settings().await?.unwrap_or_default();
    settings.apply_env();
    if settings.credentials.is_empty() {
        eprintln!("no credentials configured; set PLAYGROUND_API_URL and PLAYGROUND_MODEL");
    }

    let host = Arc::new(McpHost::new(Duration::from_secs(30), Duration::from_secs(30)));
    for spec in settings.servers.clone() {
        let id = spec.id.clone();
        if let Err(e) = host.add_server(spec).await {
            warn!("failed to start server {id}: {e:#}");
        }
    }
    let toolbox = Arc::new(McpToolBox::new(host));
    let catalog = toolbox.refresh().await;

    let config = StoreConfig {
        defaults: settings.tab_defaults(),
        max_history: settings.playground.max_history,
    };
    let store = match storage.load_playground().await {
        Ok(Some(persisted)) => PlaygroundStore::restore(config, persisted),
        Ok(None) => PlaygroundStore::new(config),
        Err(e) => {
            warn!("ignoring unreadable playground store: {e:#}");
            PlaygroundStore::new(config)
        }
    };
    store.set_tool_catalogs(catalog);
    let persistence = spawn_persistence(&store, storage.clone());

    let router = Arc::new(ProviderRouter::from_settings(&settings));
    let playground = Arc::new(Playground::new(store.clone(), router, toolbox, &settings.playground));
    let datasets = FileDatasets::new(storage.datasets_path());
    let printer = spawn_printer(store.clone());

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(e) = handle(line, &playground, &datasets).await {
            println!("error: {e:#}");
        }
    }

    printer.abort();
    persistence.abort();
    storage.save_playground(&store.persisted()).await?;
    Ok(())
}

fn index_arg(arg: Option<&str>) -> anyhow::Result<usize> {
    let n: usize = arg.context("missing message number")?.parse()?;
    if n == 0 {
        bail!("messages are numbered from 1");
    }
    Ok(n - 1)
}

async fn handle(line: &str, playground: &Arc<Playground>, datasets: &FileDatasets) -> anyhow::Result<()> {
    let store = playground.store();
    let Some(command) = line.strip_prefix('/') else {
        let p = playground.clone();
        let text = line.to_string();
        tokio::spawn(async move { p.send(text).await });
        return Ok(());
    };
    let (cmd, rest) = command.split_once(' ').unwrap_or((command, ""));
    let rest = rest.trim();
    let mut args = rest.split_whitespace();

    match cmd {
        "help" => println!("{HELP}"),
        "new" => {
            let name = if rest.is_empty() { "New Tab" } else { rest };
            store.new_tab(name);
        }
        "tabs" => {
            for (i, t) in store.tabs().iter().enumerate() {
                let marker = if t.current { "*" } else { " " };
                let running = if t.running { " (running)" } else { "" };
                println!("{marker}{} {} [{} messages]{running}", i + 1, t.name, t.message_count);
            }
        }
        "switch" => {
            let n = index_arg(args.next())?;
            let tab = store.tabs().get(n).map(|t| t.id.clone()).context("no such tab")?;
            store.set_current_tab(&tab);
            print_transcript(&store.current_state());
        }
        "close" => {
            playground.close_tab(&store.current_tab_id());
        }
        "dup" => {
            store.duplicate_tab(&store.current_tab_id());
        }
        "rename" => {
            store.rename_tab(&store.current_tab_id(), rest);
        }
        "undo" => match playground.undo() {
            Some(d) => println!("undid to: {d}"),
            None => println!("nothing to undo"),
        },
        "redo" => match playground.redo() {
            Some(d) => println!("redid: {d}"),
            None => println!("nothing to redo"),
        },
        "clear" => playground.clear_conversation(),
        "stop" => {
            playground.stop();
        }
        "delete" => {
            if !store.delete_message(index_arg(args.next())?) {
                println!("no such message");
            }
        }
        "rerun" => {
            let index = index_arg(args.next())?;
            let p = playground.clone();
            tokio::spawn(async move { p.rerun_from_message(index).await });
        }
        "approve" | "reject" => {
            let id = args.next().context("missing tool call id")?.to_string();
            let p = playground.clone();
            let approve = cmd == "approve";
            tokio::spawn(async move {
                if approve {
                    p.approve(&id).await
                } else {
                    p.reject(&id).await
                }
            });
        }
        "auto" => store.set_auto_execute_tools(rest == "on"),
        "tools" => {
            let state = store.current_state();
            for (provider, tools) in store.tool_catalog() {
                let enabled = state.enabled_tools.get(&provider).cloned().unwrap_or_default();
                for tool in tools {
                    let mark = if enabled.contains(&tool.name) { "x" } else { " " };
                    println!("[{mark}] {provider} {}", tool.name);
                }
            }
        }
        "enable" => {
            let provider = args.next().context("missing provider id")?;
            let mut tools: Vec<String> = args.map(str::to_string).collect();
            if tools.is_empty() {
                let catalog = store.tool_catalog();
                let known = catalog.get(provider).context("unknown provider")?;
                tools = known.iter().map(|t| t.name.clone()).collect();
            }
            store.update_enabled_tools(provider, tools);
        }
        "system" => store.update_system_prompt(rest),
        "model" => store.update_model(rest),
        "temp" => {
            let t: f32 = rest.parse()?;
            store.update_settings(|s| s.temperature = Some(t));
        }
        "steps" => store.update_max_steps(rest.parse()?),
        "cut" => match rest {
            "on" | "off" => {
                if store.current_state().cut.enabled != (rest == "on") {
                    store.toggle_cut_mode();
                }
            }
            _ => {
                let start = index_arg(args.next())?;
                let end = index_arg(args.next())?;
                store.set_cut(Some(start), Some(end));
            }
        },
        "capture" => {
            let name = args.next().context("missing dataset name")?;
            let item_name = args.collect::<Vec<_>>().join(" ");
            let existing = datasets.list_datasets().await?.into_result()?;
            let dataset = match existing.into_iter().find(|d| d.name == name) {
                Some(d) => d,
                None => datasets.create_dataset(name, "").await?.into_result()?,
            };
            let item = playground.capture(datasets, &dataset.id, item_name).await?.into_result()?;
            println!("saved {} messages to {}", item.messages.len(), dataset.name);
        }
        "datasets" => {
            for d in datasets.list_datasets().await?.into_result()? {
                let count = datasets
                    .list_items(&d.id)
                    .await?
                    .data
                    .map(|items| items.len())
                    .unwrap_or(0);
                println!("{} ({count} items, updated {})", d.name, d.updated_at.format("%Y-%m-%d %H:%M"));
            }
        }
        other => println!("unknown command /{other}, try /help"),
    }
    Ok(())
}

fn print_transcript(state: &TabState) {
    for (i, m) in state.messages.iter().enumerate() {
        println!("{:>3} {}: {}", i + 1, m.role, m.text());
        for inv in m.tool_invocations() {
            println!("      tool {} [{}] {:?}", inv.tool_name, inv.tool_call_id, inv.state);
        }
    }
}

/// Echoes streamed assistant output and tool activity of the current tab.
#[derive(Default)]
struct Printer {
    tab: Option<TabId>,
    /// message id -> bytes of text already printed
    printed: HashMap<String, usize>,
    announced: HashSet<String>,
}

impl Printer {
    fn render(&mut self, tab: &TabId, state: &TabState) {
        let mut out = std::io::stdout().lock();
        if self.tab.as_ref() != Some(tab) {
            // switched tabs: only report what happens from here on
            self.tab = Some(tab.clone());
            self.printed.clear();
            self.announced.clear();
            for m in &state.messages {
                self.printed.insert(m.id.clone(), m.text().len());
                for inv in m.tool_invocations() {
                    self.announced.insert(format!("call:{}", inv.tool_call_id));
                    self.announced.insert(format!("result:{}", inv.tool_call_id));
                }
            }
            return;
        }
        for m in &state.messages {
            if m.role == Role::Assistant {
                let text = m.text();
                let done = self.printed.entry(m.id.clone()).or_insert(0);
                if let Some(fresh) = text.get(*done..).filter(|s| !s.is_empty()) {
                    let _ = write!(out, "{}{fresh}", if *done == 0 { "\n< " } else { "" });
                    *done = text.len();
                }
            }
            for inv in m.tool_invocations() {
                let key = match inv.state {
                    InvocationState::Result => format!("result:{}", inv.tool_call_id),
                    _ => format!("call:{}", inv.tool_call_id),
                };
                if !self.announced.insert(key) {
                    continue;
                }
                match &inv.result {
                    Some(r) => {
                        let status = if r.success { "ok" } else { "failed" };
                        let summary: String = r.message.chars().take(120).collect();
                        let _ = writeln!(out, "\n  [{}] {status}: {summary}", inv.tool_name);
                    }
                    None => {
                        let _ = writeln!(
                            out,
                            "\n  [{}] {} ({})",
                            inv.tool_name, inv.args, inv.tool_call_id
                        );
                    }
                }
            }
        }
        let _ = out.flush();
    }
}

fn spawn_printer(store: Arc<PlaygroundStore>) -> JoinHandle<()> {
    let mut rx = store.subscribe();
    tokio::spawn(async move {
        let mut printer = Printer::default();
        printer.render(&store.current_tab_id(), &store.current_state());
        while rx.changed().await.is_ok() {
            printer.render(&store.current_tab_id(), &store.current_state());
        }
    })
}
