mod ai;
mod app;
mod config;
mod db;
mod error;
mod models;
mod pipeline;
mod services;
mod sources;

use app::App;
use config::Config;
use error::{AppError, Result};
use models::{GrantQuery, SortOrder};

const USAGE: &str = "Usage: grant-scout [--schedule | --list [category] [--asc | --desc] [--page N] [--limit N] | --recent [days] | --categories | --rejected | --purge]";
const REJECTED_LIMIT: u32 = 50;
const RECENT_DAYS: u32 = 7;
const PAGE_SIZE: u32 = 20;

#[derive(Debug, Default, PartialEq, Eq)]
struct ListArgs {
    category: Option<String>,
    sort: SortOrder,
    page: Option<u32>,
    limit: Option<u32>,
}

impl ListArgs {
    fn into_query(self) -> GrantQuery {
        let mut query = GrantQuery::default().sort(self.sort);
        if let Some(category) = self.category {
            query = query.category(category);
        }
        if self.page.is_some() || self.limit.is_some() {
            query = query.paginate(self.page.unwrap_or(1), self.limit.unwrap_or(PAGE_SIZE));
        }
        query
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    RunOnce,
    Schedule,
    List(ListArgs),
    Recent(u32),
    Categories,
    Rejected,
    Purge,
    Help,
}

fn parse_args(args: &[String]) -> std::result::Result<Command, String> {
    match args {
        [] => Ok(Command::RunOnce),
        [flag] if flag == "--schedule" => Ok(Command::Schedule),
        [flag, rest @ ..] if flag == "--list" => parse_list(rest).map(Command::List),
        [flag] if flag == "--recent" => Ok(Command::Recent(RECENT_DAYS)),
        [flag, days] if flag == "--recent" => parse_number(Some(days), flag).map(Command::Recent),
        [flag] if flag == "--categories" => Ok(Command::Categories),
        [flag] if flag == "--rejected" => Ok(Command::Rejected),
        [flag] if flag == "--purge" => Ok(Command::Purge),
        [flag] if flag == "--help" || flag == "-h" => Ok(Command::Help),
        _ => Err(format!("Unrecognised arguments: {}", args.join(" "))),
    }
}

fn parse_list(args: &[String]) -> std::result::Result<ListArgs, String> {
    let mut list = ListArgs::default();
    let mut args = args.iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--asc" => list.sort = SortOrder::Asc,
            "--desc" => list.sort = SortOrder::Desc,
            "--page" => list.page = Some(parse_number(args.next(), arg)?),
            "--limit" => list.limit = Some(parse_number(args.next(), arg)?),
            category if !category.starts_with('-') && list.category.is_none() => {
                list.category = Some(category.to_string())
            }
            other => return Err(format!("Unrecognised list option: {other}")),
        }
    }
    Ok(list)
}

fn parse_number(value: Option<&String>, flag: &str) -> std::result::Result<u32, String> {
    let value = value.ok_or_else(|| format!("{flag} expects a number"))?;
    value
        .parse()
        .map_err(|_| format!("Invalid number for {flag}: {value}"))
}

async fn open_app() -> Result<App> {
    let config = Config::load()?;
    App::new(config).await
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("grant_scout=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args).map_err(|message| {
        eprintln!("{message}\n{USAGE}");
        AppError::Config(message)
    })?;

    match command {
        Command::Help => println!("{USAGE}"),
        Command::RunOnce => {
            let inserted = open_app().await?.run_once().await?;
            println!("Found {} new grants", inserted.len());
        }
        Command::Schedule => open_app().await?.run_scheduled().await?,
        Command::List(list) => {
            let page = open_app().await?.list(list.into_query()).await?;
            print_grants(&page.grants);
            if (page.grants.len() as i64) < page.total {
                println!("Showing {} of {} grants", page.grants.len(), page.total);
            }
        }
        Command::Recent(days) => {
            print_grants(&open_app().await?.repository.recent_grants(days).await?)
        }
        Command::Categories => {
            for category in open_app().await?.repository.categories().await? {
                println!("{category}");
            }
        }
        Command::Rejected => {
            for record in open_app().await?.rejected(REJECTED_LIMIT).await? {
                println!(
                    "{}  {}  {}",
                    record.created_at.format("%Y-%m-%d"),
                    record.rejection_reason,
                    record.url
                );
            }
        }
        Command::Purge => {
            let removed = open_app().await?.purge().await?;
            println!("Removed {} expired grants", removed);
        }
    }

    Ok(())
}

fn print_grants(grants: &[models::Grant]) {
    for grant in grants {
        let deadline = grant
            .deadline
            .map(|d| d.format("%d-%m-%Y").to_string())
            .unwrap_or_else(|| "open".to_string());
        println!(
            "{:<10}  [{}]  {}\n            {}",
            deadline, grant.category, grant.title, grant.url
        );
    }
    println!("{} grants", grants.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_commands() {
        assert_eq!(parse_args(&args(&[])), Ok(Command::RunOnce));
        assert_eq!(parse_args(&args(&["--schedule"])), Ok(Command::Schedule));
        assert_eq!(
            parse_args(&args(&["--list"])),
            Ok(Command::List(ListArgs::default()))
        );
        assert_eq!(
            parse_args(&args(&["--list", "освіта"])),
            Ok(Command::List(ListArgs {
                category: Some("освіта".to_string()),
                ..ListArgs::default()
            }))
        );
        assert_eq!(parse_args(&args(&["--recent"])), Ok(Command::Recent(7)));
        assert_eq!(parse_args(&args(&["--recent", "30"])), Ok(Command::Recent(30)));
        assert_eq!(parse_args(&args(&["--categories"])), Ok(Command::Categories));
        assert_eq!(parse_args(&args(&["--rejected"])), Ok(Command::Rejected));
        assert_eq!(parse_args(&args(&["--purge"])), Ok(Command::Purge));
        assert_eq!(parse_args(&args(&["--help"])), Ok(Command::Help));
    }

    #[test]
    fn parses_list_options_in_any_order() {
        assert_eq!(
            parse_args(&args(&["--list", "--desc", "--page", "2", "HR", "--limit", "5"])),
            Ok(Command::List(ListArgs {
                category: Some("HR".to_string()),
                sort: SortOrder::Desc,
                page: Some(2),
                limit: Some(5),
            }))
        );
    }

    #[test]
    fn list_paging_defaults_the_missing_half() {
        let query = ListArgs {
            page: Some(3),
            ..ListArgs::default()
        }
        .into_query();
        assert_eq!((query.page, query.limit), (Some(3), Some(PAGE_SIZE)));

        let query = ListArgs::default().into_query();
        assert_eq!((query.page, query.limit), (None, None));
        assert_eq!(query.sort, SortOrder::Asc);
    }

    #[test]
    fn rejects_unknown_arguments() {
        assert!(parse_args(&args(&["--refresh"])).is_err());
        assert!(parse_args(&args(&["--purge", "now"])).is_err());
        assert!(parse_args(&args(&["--recent", "week"])).is_err());
        assert!(parse_args(&args(&["--list", "--page"])).is_err());
        assert!(parse_args(&args(&["--list", "HR", "освіта"])).is_err());
    }
}
