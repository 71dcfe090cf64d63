//! Command line front end for the todo.txt engine.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand, ValueEnum};

use todotxt::{
    FileTaskStore, LineEnding, ListPrefs, Priority, SortKey, TaskFilter, TaskId, TaskList,
    sort_tasks,
};

#[derive(Debug, Parser)]
#[command(name = "todotxt", about = "Manage a todo.txt task file", version)]
struct Cli {
    /// Path to the todo file
    #[arg(long, default_value = "todo.txt", global = true)]
    file: PathBuf,

    /// Path to the done archive (defaults to done.txt next to the todo file)
    #[arg(long, global = true)]
    done_file: Option<PathBuf>,

    /// Write files with Windows line endings
    #[arg(long, global = true)]
    crlf: bool,

    /// Do not stamp new tasks with today's date
    #[arg(long, global = true)]
    no_prepend_date: bool,

    /// Insert new tasks at the top of the file instead of the bottom
    #[arg(long, global = true)]
    add_at_top: bool,

    /// Print progress information to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show tasks, optionally filtered and sorted
    List(ListArgs),
    /// Add a new task
    Add(AddArgs),
    /// Mark a task complete
    Done(DoneArgs),
    /// Mark a completed task incomplete again
    Undo(UndoArgs),
    /// Move completed tasks to the done file
    Archive,
    /// Show the distinct contexts in use
    Contexts(TagArgs),
    /// Show the distinct projects in use
    Projects(TagArgs),
    /// Show the distinct priorities in use
    Priorities,
}

#[derive(Debug, Args)]
struct ListArgs {
    /// Only tasks with this context ("-" matches tasks without one)
    #[arg(long = "context")]
    contexts: Vec<String>,

    /// Only tasks with this project ("-" matches tasks without one)
    #[arg(long = "project")]
    projects: Vec<String>,

    /// Only tasks with this priority code ("-" matches unprioritized)
    #[arg(long = "priority")]
    priorities: Vec<String>,

    #[arg(long)]
    hide_completed: bool,

    /// Hide tasks whose threshold date is still in the future
    #[arg(long)]
    hide_future: bool,

    /// Sort keys, applied in order
    #[arg(long = "sort", value_enum)]
    sort: Vec<SortArg>,

    /// Emit the matching tasks as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SortArg {
    File,
    Priority,
    Alpha,
    Due,
    Threshold,
}

impl From<SortArg> for SortKey {
    fn from(arg: SortArg) -> SortKey {
        match arg {
            SortArg::File => SortKey::FileOrder,
            SortArg::Priority => SortKey::Priority,
            SortArg::Alpha => SortKey::Alphabetical,
            SortArg::Due => SortKey::DueDate,
            SortArg::Threshold => SortKey::ThresholdDate,
        }
    }
}

#[derive(Debug, Args)]
struct AddArgs {
    /// The task text, todo.txt syntax
    text: String,
}

#[derive(Debug, Args)]
struct DoneArgs {
    /// Task id as shown by `list`
    id: u64,

    /// Completion date (defaults to today)
    #[arg(long)]
    date: Option<NaiveDate>,
}

#[derive(Debug, Args)]
struct UndoArgs {
    /// Task id as shown by `list`
    id: u64,
}

#[derive(Debug, Args)]
struct TagArgs {
    /// Include the "-" entry standing for tasks without a tag
    #[arg(long)]
    include_none: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = cli.verbose;
    let today = Local::now().date_naive();
    let mut list = open_list(&cli)?;

    match &cli.command {
        Commands::List(args) => handle_list(&mut list, args, today),
        Commands::Add(args) => handle_add(&mut list, args, today, verbose),
        Commands::Done(args) => handle_done(&mut list, args, today, verbose),
        Commands::Undo(args) => handle_undo(&mut list, args, verbose),
        Commands::Archive => handle_archive(&mut list, verbose),
        Commands::Contexts(args) => handle_contexts(&mut list, args),
        Commands::Projects(args) => handle_projects(&mut list, args),
        Commands::Priorities => handle_priorities(&mut list),
    }
}

fn open_list(cli: &Cli) -> Result<TaskList<FileTaskStore>> {
    let done_path = match &cli.done_file {
        Some(path) => path.clone(),
        None => cli.file.with_file_name("done.txt"),
    };
    let prefs = ListPrefs {
        prepend_date: !cli.no_prepend_date,
        add_at_end: !cli.add_at_top,
        line_ending: if cli.crlf {
            LineEnding::Windows
        } else {
            LineEnding::Unix
        },
    };
    let store = FileTaskStore::new(cli.file.clone(), done_path, prefs.line_ending)
        .with_context(|| format!("opening {}", cli.file.display()))?;
    let mut list = TaskList::new(store, prefs);
    list.reload()
        .with_context(|| format!("loading {}", cli.file.display()))?;
    Ok(list)
}

fn handle_list(list: &mut TaskList<FileTaskStore>, args: &ListArgs, today: NaiveDate) -> Result<()> {
    let filter = TaskFilter {
        contexts: args.contexts.clone(),
        projects: args.projects.clone(),
        priorities: args
            .priorities
            .iter()
            .map(|code| Priority::from_code(code))
            .collect(),
        hide_completed: args.hide_completed,
        hide_future: args.hide_future,
    };
    let mut matching = filter.apply(list.tasks(), today);
    let keys: Vec<SortKey> = args.sort.iter().map(|&k| k.into()).collect();
    if !keys.is_empty() {
        sort_tasks(&mut matching, &keys);
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&matching)?);
        return Ok(());
    }
    for task in matching {
        println!("{:>4} {}", task.id.0, task.in_screen_format());
    }
    Ok(())
}

fn handle_add(
    list: &mut TaskList<FileTaskStore>,
    args: &AddArgs,
    today: NaiveDate,
    verbose: bool,
) -> Result<()> {
    if args.text.trim().is_empty() {
        bail!("refusing to add an empty task");
    }
    let task = list.add_as_task(&args.text, today)?;
    if verbose {
        eprintln!("added task {}", task.id.0);
    }
    println!("{}", task.in_file_format());
    Ok(())
}

fn handle_done(
    list: &mut TaskList<FileTaskStore>,
    args: &DoneArgs,
    today: NaiveDate,
    verbose: bool,
) -> Result<()> {
    let id = TaskId(args.id);
    let date = args.date.unwrap_or(today);
    let formatted = {
        let task = match list.task_mut(id) {
            Some(task) => task,
            None => bail!("no task with id {}", args.id),
        };
        task.mark_complete(date);
        task.in_file_format()
    };
    list.store()?;
    if verbose {
        eprintln!("completed task {}", args.id);
    }
    println!("{formatted}");
    Ok(())
}

fn handle_undo(list: &mut TaskList<FileTaskStore>, args: &UndoArgs, verbose: bool) -> Result<()> {
    let id = TaskId(args.id);
    let formatted = {
        let task = match list.task_mut(id) {
            Some(task) => task,
            None => bail!("no task with id {}", args.id),
        };
        task.mark_incomplete();
        task.in_file_format()
    };
    list.store()?;
    if verbose {
        eprintln!("reopened task {}", args.id);
    }
    println!("{formatted}");
    Ok(())
}

fn handle_archive(list: &mut TaskList<FileTaskStore>, verbose: bool) -> Result<()> {
    let moved = list.archive(None)?;
    if verbose {
        eprintln!("archived {moved} tasks");
    }
    println!("{moved}");
    Ok(())
}

fn handle_contexts(list: &mut TaskList<FileTaskStore>, args: &TagArgs) -> Result<()> {
    for context in list.get_contexts(args.include_none) {
        println!("{context}");
    }
    Ok(())
}

fn handle_projects(list: &mut TaskList<FileTaskStore>, args: &TagArgs) -> Result<()> {
    for project in list.get_projects(args.include_none) {
        println!("{project}");
    }
    Ok(())
}

fn handle_priorities(list: &mut TaskList<FileTaskStore>) -> Result<()> {
    for priority in list.get_priorities() {
        println!("{}", priority.code());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn cli_for(dir: &tempfile::TempDir) -> Cli {
        Cli::parse_from([
            "todotxt",
            "--file",
            dir.path().join("todo.txt").to_str().expect("utf8 path"),
            "list",
        ])
    }

    #[test]
    fn add_then_done_updates_the_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cli = cli_for(&tmp);
        let mut list = open_list(&cli).expect("open");

        handle_add(
            &mut list,
            &AddArgs {
                text: "Call mom @home".into(),
            },
            date(2024, 1, 1),
            false,
        )
        .expect("add");

        handle_done(
            &mut list,
            &DoneArgs {
                id: 0,
                date: Some(date(2024, 2, 1)),
            },
            date(2024, 2, 1),
            false,
        )
        .expect("done");

        let text = fs::read_to_string(tmp.path().join("todo.txt")).expect("read");
        assert_eq!(text, "x 2024-02-01 2024-01-01 Call mom @home\n");
    }

    #[test]
    fn blank_add_is_rejected_before_the_repository() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cli = cli_for(&tmp);
        let mut list = open_list(&cli).expect("open");

        let err = handle_add(
            &mut list,
            &AddArgs { text: "   ".into() },
            date(2024, 1, 1),
            false,
        );
        assert!(err.is_err());
        assert_eq!(list.size(), 0);
    }

    #[test]
    fn done_with_unknown_id_fails() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cli = cli_for(&tmp);
        let mut list = open_list(&cli).expect("open");

        let err = handle_done(
            &mut list,
            &DoneArgs { id: 7, date: None },
            date(2024, 1, 1),
            false,
        );
        assert!(err.is_err());
    }

    #[test]
    fn archive_command_reports_moved_count() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("todo.txt"), "x 2024-01-01 old\nkeep\n").expect("seed");
        let cli = cli_for(&tmp);
        let mut list = open_list(&cli).expect("open");

        handle_archive(&mut list, false).expect("archive");
        assert_eq!(list.size(), 1);
        let done = fs::read_to_string(tmp.path().join("done.txt")).expect("done");
        assert_eq!(done, "x 2024-01-01 old\n");
    }
}
