use anyhow::Result;
use query::GraphQueryEngine;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::{print_answer, print_json};

const HELP: &str = "Ask a question, or use:
  stats                 graph statistics
  entity <name>         details about an entity
  path <a> to <b>       paths between two entities
  quit                  leave";

#[derive(Debug, PartialEq, Eq)]
enum ChatCommand<'a> {
    Empty,
    Quit,
    Help,
    Stats,
    Entity(&'a str),
    Path(&'a str, &'a str),
    Question(&'a str),
}

fn parse_command(input: &str) -> ChatCommand<'_> {
    let input = input.trim();
    let lower = input.to_ascii_lowercase();
    match lower.as_str() {
        "" => return ChatCommand::Empty,
        "quit" | "exit" | "q" => return ChatCommand::Quit,
        "help" | "?" => return ChatCommand::Help,
        "stats" => return ChatCommand::Stats,
        _ => {}
    }

    if lower.starts_with("entity ") {
        return ChatCommand::Entity(input["entity ".len()..].trim());
    }
    if lower.starts_with("path ") {
        let rest = &input["path ".len()..];
        if let Some(split) = rest.to_ascii_lowercase().find(" to ") {
            let (source, target) = (rest[..split].trim(), rest[split + " to ".len()..].trim());
            if !source.is_empty() && !target.is_empty() {
                return ChatCommand::Path(source, target);
            }
        }
    }
    ChatCommand::Question(input)
}

/// Line-oriented loop over stdin until `quit` or end of input.
pub async fn run(engine: &GraphQueryEngine) -> Result<()> {
    let stats = engine.stats(0);
    println!(
        "Knowledge graph loaded: {} entities, {} relationships",
        stats.total_nodes, stats.total_edges
    );
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\n> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };

        match parse_command(&line) {
            ChatCommand::Empty => {}
            ChatCommand::Quit => break,
            ChatCommand::Help => println!("{HELP}"),
            ChatCommand::Stats => print_json(&engine.stats(engine.config().top_entities))?,
            ChatCommand::Entity(name) => match engine.get_entity_info(name) {
                Some(info) => print_json(&info)?,
                None => println!("Entity '{name}' not found"),
            },
            ChatCommand::Path(source, target) => {
                let paths = engine.find_paths(source, target, engine.config().max_path_depth);
                if paths.is_empty() {
                    println!("No path found between '{source}' and '{target}'");
                }
                for path in paths {
                    println!("  {}", path.join(" -> "));
                }
            }
            ChatCommand::Question(question) => print_answer(&engine.answer(question).await),
        }
    }
    Ok(())
}
