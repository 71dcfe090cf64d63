//! Todo.txt domain library: line grammar, metadata extraction, and the
//! file-backed task list repository. The core stays pure; parsing and
//! formatting round-trip the canonical line format, and all file I/O is
//! confined to the `storage` module.

pub mod core {
    use chrono::NaiveDate;
    use regex::Regex;
    use serde::{Deserialize, Serialize};
    use std::cmp::Ordering;
    use std::sync::LazyLock;

    use crate::{extract, format, parser};

    pub const DATE_FORMAT: &str = "%Y-%m-%d";

    /* ------------------------------- IDs ------------------------------- */

    /// Opaque task handle. Assigned by the repository from file position on
    /// load/add; renumbered on `reload()`, never derived from content.
    #[derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    )]
    #[serde(transparent)]
    pub struct TaskId(pub u64);

    /* ----------------------------- Priority ----------------------------- */

    /// Single-letter priority `(A)`..`(Z)`, or none. Totally ordered with
    /// `A < B < ... < Z < None` so that unprioritized tasks sort last.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum Priority {
        Code(char),
        None,
    }

    impl Priority {
        /// Case-sensitive conversion from a one-letter code. Anything that is
        /// not a single uppercase ASCII letter maps to `Priority::None`.
        pub fn from_code(code: &str) -> Priority {
            let mut chars = code.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii_uppercase() => Priority::Code(c),
                _ => Priority::None,
            }
        }

        pub fn code(&self) -> String {
            match self {
                Priority::Code(c) => c.to_string(),
                Priority::None => "-".to_string(),
            }
        }

        pub fn in_file_format(&self) -> String {
            match self {
                Priority::Code(c) => format!("({c})"),
                Priority::None => String::new(),
            }
        }

        /// Position in the selectable sequence `None, A, B, ..., Z`.
        fn ordinal(&self) -> usize {
            match self {
                Priority::None => 0,
                Priority::Code(c) => (*c as u8 - b'A') as usize + 1,
            }
        }

        fn from_ordinal(n: usize) -> Priority {
            if n == 0 {
                Priority::None
            } else {
                Priority::Code((b'A' + (n - 1) as u8) as char)
            }
        }

        /// Enumerate codes between two priorities inclusive, in selectable
        /// order (`None` first). `range_in_code(None, Code('Z'))` yields
        /// `["-", "A", ..., "Z"]`.
        pub fn range_in_code(from: Priority, to: Priority) -> Vec<String> {
            let (a, b) = (from.ordinal(), to.ordinal());
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            (lo..=hi).map(|n| Priority::from_ordinal(n).code()).collect()
        }
    }

    impl Ord for Priority {
        fn cmp(&self, other: &Self) -> Ordering {
            match (self, other) {
                (Priority::Code(a), Priority::Code(b)) => a.cmp(b),
                (Priority::Code(_), Priority::None) => Ordering::Less,
                (Priority::None, Priority::Code(_)) => Ordering::Greater,
                (Priority::None, Priority::None) => Ordering::Equal,
            }
        }
    }

    impl PartialOrd for Priority {
        fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
            Some(self.cmp(other))
        }
    }

    /* ------------------------------- Tags ------------------------------- */

    static TAG_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^\S*[A-Za-z0-9_]$").expect("tag pattern"));

    /// A tag token is valid when it contains no whitespace and ends in a
    /// word character (no trailing punctuation).
    pub fn valid_tag(tag: &str) -> bool {
        TAG_RE.is_match(tag)
    }

    /* ------------------------------ Errors ------------------------------ */

    #[derive(Debug, thiserror::Error)]
    pub enum TodoError {
        /// A backing-store operation failed; `action` describes what was
        /// attempted. Fatal to the triggering operation, not to the caller.
        #[error("{action}")]
        Persist {
            action: String,
            #[source]
            source: std::io::Error,
        },
        /// Rejected tag token on an explicit add; the task is unchanged.
        #[error("invalid tag {0:?}")]
        InvalidTag(String),
    }

    /* ------------------------------- Task ------------------------------- */

    /// One logical todo item. The derived fields (`contexts` through
    /// `links`) are recomputed from `text` on every structural change; all
    /// mutation goes through the methods below, which re-parse the
    /// formatted line so the derived state can never drift.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Task {
        pub id: TaskId,
        /// The raw line this task was last initialized from.
        pub original_text: String,
        pub priority: Priority,
        pub completed: bool,
        pub completion_date: Option<NaiveDate>,
        pub prepended_date: Option<NaiveDate>,
        /// Body with metadata markers still embedded.
        pub text: String,
        /// Set when the body is blank; the task is logically removed but
        /// stays in the collection until the caller deletes it.
        pub deleted: bool,

        pub contexts: Vec<String>,
        pub projects: Vec<String>,
        pub due_date: Option<NaiveDate>,
        pub threshold_date: Option<NaiveDate>,
        pub phone_numbers: Vec<String>,
        pub mail_addresses: Vec<String>,
        pub links: Vec<String>,
    }

    impl Task {
        pub fn new(id: TaskId, raw: &str) -> Task {
            Task::with_default_date(id, raw, None)
        }

        /// Construct from a raw line, stamping `default_prepended` as the
        /// creation date when the line carries none.
        pub fn with_default_date(
            id: TaskId,
            raw: &str,
            default_prepended: Option<NaiveDate>,
        ) -> Task {
            let mut task = Task {
                id,
                original_text: String::new(),
                priority: Priority::None,
                completed: false,
                completion_date: None,
                prepended_date: None,
                text: String::new(),
                deleted: false,
                contexts: vec![],
                projects: vec![],
                due_date: None,
                threshold_date: None,
                phone_numbers: vec![],
                mail_addresses: vec![],
                links: vec![],
            };
            task.init(raw, default_prepended);
            task
        }

        /// Re-initialize every field from a raw line. Never fails: a line
        /// the grammar cannot split lands in `text` verbatim.
        pub fn init(&mut self, raw: &str, default_prepended: Option<NaiveDate>) {
            let parsed = parser::parse_task_line(raw);
            self.completed = parsed.completed;
            self.completion_date = parsed.completion_date;
            self.priority = parsed.priority;
            self.prepended_date = parsed.prepended_date.or(default_prepended);
            self.text = parsed.body;
            self.original_text = raw.to_string();
            self.deleted = self.text.trim().is_empty();

            self.contexts = extract::contexts(&self.text);
            self.projects = extract::projects(&self.text);
            self.due_date = extract::due_date(&self.text);
            self.threshold_date = extract::threshold_date(&self.text);
            self.phone_numbers = extract::phone_numbers(&self.text);
            self.mail_addresses = extract::mail_addresses(&self.text);
            self.links = extract::links(&self.text);
        }

        pub fn update(&mut self, raw: &str) {
            self.init(raw, None);
        }

        pub fn in_file_format(&self) -> String {
            format::in_file_format(self)
        }

        pub fn in_screen_format(&self) -> String {
            format::in_screen_format(self)
        }

        /// Priority is structural, not embedded in the body; no reparse.
        pub fn set_priority(&mut self, priority: Priority) {
            self.priority = priority;
        }

        pub fn set_prepended_date(&mut self, date: NaiveDate) {
            self.prepended_date = Some(date);
        }

        pub fn mark_complete(&mut self, date: NaiveDate) {
            if !self.completed {
                self.completion_date = Some(date);
                self.deleted = false;
                self.completed = true;
            }
        }

        pub fn mark_incomplete(&mut self) {
            if self.completed {
                self.completion_date = None;
                self.completed = false;
            }
        }

        /// Logical removal: blank the body, which flags the task deleted.
        pub fn delete(&mut self) {
            self.update("");
        }

        /// Append a fragment and re-parse the whole line. This is the only
        /// path by which tags and metadata are added, so the derived fields
        /// always agree with the body.
        pub fn append(&mut self, fragment: &str) {
            let line = format!("{} {}", self.in_file_format(), fragment);
            self.init(&line, None);
        }

        /// Remove the first literal occurrence of `tag` from the formatted
        /// line, collapse the resulting double spaces, and re-parse.
        pub fn remove_tag(&mut self, tag: &str) {
            let formatted = self.in_file_format();
            let replaced = match formatted.find(tag) {
                Some(pos) => {
                    let mut s = String::with_capacity(formatted.len());
                    s.push_str(&formatted[..pos]);
                    s.push(' ');
                    s.push_str(&formatted[pos + tag.len()..]);
                    s
                }
                None => formatted,
            };
            let mut collapsed = replaced;
            while collapsed.contains("  ") {
                collapsed = collapsed.replace("  ", " ");
            }
            let trimmed = collapsed.trim().to_string();
            self.init(&trimmed, None);
        }

        /// Tag the task with a `+project`. No-op when already tagged;
        /// rejects invalid tokens and leaves the task unchanged.
        pub fn add_tag(&mut self, tag: &str) -> Result<(), TodoError> {
            if !valid_tag(tag) {
                return Err(TodoError::InvalidTag(tag.to_string()));
            }
            if !self.projects.iter().any(|p| p == tag) {
                self.append(&format!("+{tag}"));
            }
            Ok(())
        }

        /// Add the task to an `@context` list, same contract as `add_tag`.
        pub fn add_list(&mut self, list: &str) -> Result<(), TodoError> {
            if !valid_tag(list) {
                return Err(TodoError::InvalidTag(list.to_string()));
            }
            if !self.contexts.iter().any(|c| c == list) {
                self.append(&format!("@{list}"));
            }
            Ok(())
        }

        /// Replace an existing `due:` tag in place, or append one.
        pub fn defer_due_date(&mut self, defer: &str) {
            let contents = self.in_file_format();
            let new_contents = if self.due_date.is_some() {
                extract::DUE_RE
                    .replace(&contents, format!(" due:{defer}").as_str())
                    .into_owned()
            } else {
                format!("{contents} due:{defer}")
            };
            self.update(&new_contents);
        }

        /// Replace an existing `t:` threshold tag in place, or append one.
        pub fn defer_threshold_date(&mut self, defer: &str) {
            let contents = self.in_file_format();
            let new_contents = if self.threshold_date.is_some() {
                extract::THRESHOLD_RE
                    .replace(&contents, format!(" t:{defer}").as_str())
                    .into_owned()
            } else {
                format!("{contents} t:{defer}")
            };
            self.update(&new_contents);
        }

        pub fn defer_to_date(&mut self, is_threshold: bool, date: NaiveDate) {
            let defer = date.format(DATE_FORMAT).to_string();
            if is_threshold {
                self.defer_threshold_date(&defer);
            } else {
                self.defer_due_date(&defer);
            }
        }

        /// Clone-by-reformat into an existing task, used before
        /// destructive edits.
        pub fn copy_into(&self, destination: &mut Task) {
            destination.id = self.id;
            let formatted = self.in_file_format();
            destination.init(&formatted, None);
        }

        /// True when the threshold date lies strictly after `today`.
        pub fn in_future(&self, today: NaiveDate) -> bool {
            match self.threshold_date {
                Some(threshold) => threshold > today,
                None => false,
            }
        }

        /// Human-readable age of the creation stamp, if any.
        pub fn relative_age(&self, today: NaiveDate) -> Option<String> {
            self.prepended_date
                .map(|date| compute_relative_date(today, date))
        }
    }

    /// Value equality on the formatted line only; identity is carried by
    /// `TaskId` and compared separately.
    impl PartialEq for Task {
        fn eq(&self, other: &Self) -> bool {
            self.in_file_format() == other.in_file_format()
        }
    }

    impl Eq for Task {}

    /// Render a date relative to `now`. Computed from the day delta so
    /// month boundaries cannot skew the result.
    pub fn compute_relative_date(now: NaiveDate, when: NaiveDate) -> String {
        let days = (now - when).num_days();
        if days < 0 {
            return when.format(DATE_FORMAT).to_string();
        }
        match days {
            0 => "today".to_string(),
            1 => "1 day ago".to_string(),
            d if d < 30 => format!("{d} days ago"),
            d if d < 60 => "1 month ago".to_string(),
            d if d < 365 => format!("{} months ago", d / 30),
            d if d < 730 => "1 year ago".to_string(),
            d => format!("{} years ago", d / 365),
        }
    }

}

pub mod extract {
    //! Stateless extractors over the task body. Each is a pure function:
    //! malformed input yields an empty result, never an error.

    use chrono::NaiveDate;
    use indexmap::IndexSet;
    use regex::Regex;
    use std::sync::LazyLock;

    use crate::core::DATE_FORMAT;

    pub(crate) static DUE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\sdue:(\d{4}-\d{2}-\d{2})").expect("due pattern"));
    pub(crate) static THRESHOLD_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\st:(\d{4}-\d{2}-\d{2})").expect("threshold pattern"));
    static MAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("mail pattern")
    });
    static LINK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?:https?|ftp|file)://\S+").expect("link pattern"));

    fn marked_tokens(text: &str, marker: char) -> Vec<String> {
        let mut out: IndexSet<&str> = IndexSet::new();
        for token in text.split_whitespace() {
            if let Some(rest) = token.strip_prefix(marker) {
                if !rest.is_empty() {
                    out.insert(rest);
                }
            }
        }
        out.into_iter().map(|s| s.to_string()).collect()
    }

    /// `@context` tokens, first-occurrence order, de-duplicated.
    pub fn contexts(text: &str) -> Vec<String> {
        marked_tokens(text, '@')
    }

    /// `+project` tokens, first-occurrence order, de-duplicated.
    pub fn projects(text: &str) -> Vec<String> {
        marked_tokens(text, '+')
    }

    fn first_tag_date(re: &Regex, text: &str) -> Option<NaiveDate> {
        let caps = re.captures(text)?;
        NaiveDate::parse_from_str(&caps[1], DATE_FORMAT).ok()
    }

    /// First `due:yyyy-mm-dd` tag; unparseable dates are treated as absent.
    pub fn due_date(text: &str) -> Option<NaiveDate> {
        first_tag_date(&DUE_RE, text)
    }

    /// First `t:yyyy-mm-dd` threshold tag.
    pub fn threshold_date(text: &str) -> Option<NaiveDate> {
        first_tag_date(&THRESHOLD_RE, text)
    }

    /// Tokens that look like dialable phone numbers: optional leading `+`,
    /// digits with separators, at least ten digits total. Used only for
    /// quick-action affordances; no mutation semantics attach to these.
    pub fn phone_numbers(text: &str) -> Vec<String> {
        text.split_whitespace()
            .filter(|token| {
                let body = token.strip_prefix('+').unwrap_or(token);
                !body.is_empty()
                    && body
                        .chars()
                        .all(|c| c.is_ascii_digit() || matches!(c, '-' | '(' | ')'))
                    && body.chars().filter(|c| c.is_ascii_digit()).count() >= 10
            })
            .map(|s| s.to_string())
            .collect()
    }

    pub fn mail_addresses(text: &str) -> Vec<String> {
        MAIL_RE
            .find_iter(text)
            .map(|m| m.as_str().to_string())
            .collect()
    }

    pub fn links(text: &str) -> Vec<String> {
        LINK_RE
            .find_iter(text)
            .map(|m| m.as_str().to_string())
            .collect()
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::NaiveDate;

        #[test]
        fn tag_extraction_order_and_dedup() {
            let body = "+b @x +a +b";
            assert_eq!(projects(body), vec!["b", "a"]);
            assert_eq!(contexts(body), vec!["x"]);
        }

        #[test]
        fn bare_markers_are_ignored() {
            assert!(contexts("send @ the thing").is_empty());
            assert!(projects("2 + 2").is_empty());
        }

        #[test]
        fn due_and_threshold_first_match_wins() {
            let body = "pay due:2024-01-10 then due:2024-02-10 t:2024-01-01";
            assert_eq!(
                due_date(body),
                NaiveDate::from_ymd_opt(2024, 1, 10)
            );
            assert_eq!(
                threshold_date(body),
                NaiveDate::from_ymd_opt(2024, 1, 1)
            );
        }

        #[test]
        fn malformed_date_is_absent() {
            assert_eq!(due_date("pay due:2024-13-40"), None);
            assert_eq!(due_date("due:2024-01-10"), None); // needs a leading separator
            assert_eq!(threshold_date("no tags here"), None);
        }

        #[test]
        fn phone_mail_link_extraction() {
            let body = "call +31-20-1234567 or mail help@example.com, see https://example.com/x";
            assert_eq!(phone_numbers(body), vec!["+31-20-1234567"]);
            assert_eq!(mail_addresses(body), vec!["help@example.com"]);
            assert_eq!(links(body), vec!["https://example.com/x"]);
        }

        #[test]
        fn short_digit_runs_are_not_phone_numbers() {
            assert!(phone_numbers("meet at 2024-01-10 10:00").is_empty());
        }
    }
}

pub mod parser {
    //! The todo.txt line grammar, built on `nom`. Splitting order is fixed:
    //! completion marker, completion date, priority (incomplete lines
    //! only), prepended date, body. A token that fails to match simply
    //! falls through into the body, so parsing never errors.

    use chrono::NaiveDate;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while_m_n},
        character::complete::{char, satisfy},
        combinator::{eof, map, map_res, opt, rest},
        sequence::{delimited, terminated, tuple},
    };

    use crate::core::Priority;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ParsedLine {
        pub completed: bool,
        pub completion_date: Option<NaiveDate>,
        pub priority: Priority,
        pub prepended_date: Option<NaiveDate>,
        pub body: String,
    }

    /// Split a raw line into its structural fields.
    pub fn parse_task_line(raw: &str) -> ParsedLine {
        match task_line(raw) {
            Ok((_, parsed)) => parsed,
            Err(_) => ParsedLine {
                completed: false,
                completion_date: None,
                priority: Priority::None,
                prepended_date: None,
                body: raw.to_string(),
            },
        }
    }

    fn task_line(i: &str) -> IResult<&str, ParsedLine> {
        let (i, marker) = opt(tag("x "))(i)?;
        let completed = marker.is_some();

        let (i, completion_date) = if completed {
            opt(date_token)(i)?
        } else {
            (i, None)
        };

        let (i, priority) = if completed {
            (i, None)
        } else {
            opt(priority_token)(i)?
        };

        let (i, prepended_date) = opt(date_token)(i)?;
        let (i, body) = rest(i)?;

        Ok((
            i,
            ParsedLine {
                completed,
                completion_date,
                priority: priority.unwrap_or(Priority::None),
                prepended_date,
                body: body.to_string(),
            },
        ))
    }

    /// `(A) ` with a single uppercase letter and a trailing space.
    fn priority_token(i: &str) -> IResult<&str, Priority> {
        map(
            terminated(
                delimited(char('('), satisfy(|c| c.is_ascii_uppercase()), char(')')),
                char(' '),
            ),
            Priority::Code,
        )(i)
    }

    /// An ISO date followed by a space or the end of the line.
    fn date_token(i: &str) -> IResult<&str, NaiveDate> {
        terminated(iso_date, alt((tag(" "), eof)))(i)
    }

    fn iso_date(i: &str) -> IResult<&str, NaiveDate> {
        map_res(
            tuple((
                fixed_digits(4),
                char('-'),
                fixed_digits(2),
                char('-'),
                fixed_digits(2),
            )),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y as i32, m, d).ok_or("invalid date"),
        )(i)
    }

    fn fixed_digits(n: usize) -> impl Fn(&str) -> IResult<&str, u32> {
        move |i: &str| {
            map_res(
                take_while_m_n(n, n, |c: char| c.is_ascii_digit()),
                |s: &str| s.parse::<u32>(),
            )(i)
        }
    }

}

pub mod format {
    //! Canonical line rendering: the exact inverse of the parser, emitting
    //! tokens only when present.

    use crate::core::{DATE_FORMAT, Priority, Task};

    /// Render the task in file format. Completed tasks emit the `x` marker
    /// and dates but never the priority token; incomplete tasks never emit
    /// a completion date, stale or not.
    pub fn in_file_format(task: &Task) -> String {
        let mut out = String::new();
        if task.completed {
            out.push_str("x ");
            if let Some(date) = task.completion_date {
                out.push_str(&date.format(DATE_FORMAT).to_string());
                out.push(' ');
            }
            if let Some(date) = task.prepended_date {
                out.push_str(&date.format(DATE_FORMAT).to_string());
                out.push(' ');
            }
        } else {
            if task.priority != Priority::None {
                out.push_str(&task.priority.in_file_format());
                out.push(' ');
            }
            if let Some(date) = task.prepended_date {
                out.push_str(&date.format(DATE_FORMAT).to_string());
                out.push(' ');
            }
        }
        out.push_str(&task.text);
        out
    }

    /// Display rendering: like file format, but the priority of a completed
    /// task is still shown and the creation stamp is dropped.
    pub fn in_screen_format(task: &Task) -> String {
        let mut out = String::new();
        if task.completed {
            out.push_str("x ");
            if let Some(date) = task.completion_date {
                out.push_str(&date.format(DATE_FORMAT).to_string());
                out.push(' ');
            }
        }
        if task.priority != Priority::None {
            out.push_str(&task.priority.in_file_format());
            out.push(' ');
        }
        out.push_str(&task.text);
        out
    }

}

pub mod storage {
    //! Line-based persistence for the primary todo file and the done
    //! archive. All replacing writes go through a sibling temp file and an
    //! atomic rename, so an interrupted store is never observable as a
    //! half-written file.

    use std::fs;
    use std::io::Write;
    use std::path::{Path, PathBuf};

    use serde::{Deserialize, Serialize};
    use tempfile::NamedTempFile;

    use crate::core::{Task, TodoError};

    /// Preference-selected line terminator for the backing files.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub enum LineEnding {
        #[default]
        Unix,
        Windows,
    }

    impl LineEnding {
        pub fn as_str(&self) -> &'static str {
            match self {
                LineEnding::Unix => "\n",
                LineEnding::Windows => "\r\n",
            }
        }
    }

    /// Seam between the repository and the filesystem.
    pub trait TaskStore {
        /// Ordered raw lines of the primary store; blank lines skipped.
        fn load(&self) -> Result<Vec<String>, TodoError>;

        /// Replace the primary store with one formatted line per task.
        fn store(&self, tasks: &[Task]) -> Result<(), TodoError>;

        /// Append `completed` to the done store and replace the primary
        /// store with `incomplete`, staging both before either replace.
        fn archive(&self, completed: &[Task], incomplete: &[Task]) -> Result<(), TodoError>;
    }

    pub struct FileTaskStore {
        pub todo_path: PathBuf,
        pub done_path: PathBuf,
        pub line_ending: LineEnding,
    }

    impl FileTaskStore {
        /// Creates the primary file (and its parent directory) when absent.
        pub fn new(
            todo_path: PathBuf,
            done_path: PathBuf,
            line_ending: LineEnding,
        ) -> Result<FileTaskStore, TodoError> {
            let store = FileTaskStore {
                todo_path,
                done_path,
                line_ending,
            };
            store.ensure_todo_file()?;
            Ok(store)
        }

        fn ensure_todo_file(&self) -> Result<(), TodoError> {
            if self.todo_path.exists() {
                return Ok(());
            }
            if let Some(parent) = self.todo_path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)
                        .map_err(|e| persist_err("creating todo directory", e))?;
                }
            }
            fs::write(&self.todo_path, b"").map_err(|e| persist_err("creating todo file", e))
        }

        fn render(&self, tasks: &[Task]) -> String {
            let terminator = self.line_ending.as_str();
            let mut out = String::new();
            for task in tasks {
                out.push_str(&task.in_file_format());
                out.push_str(terminator);
            }
            out
        }

        fn stage(path: &Path, contents: &str) -> std::io::Result<NamedTempFile> {
            let parent = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => Path::new("."),
            };
            let mut tmp = NamedTempFile::new_in(parent)?;
            tmp.write_all(contents.as_bytes())?;
            Ok(tmp)
        }

        fn replace(path: &Path, contents: &str) -> std::io::Result<()> {
            let tmp = Self::stage(path, contents)?;
            tmp.persist(path).map_err(|e| e.error)?;
            Ok(())
        }
    }

    impl TaskStore for FileTaskStore {
        fn load(&self) -> Result<Vec<String>, TodoError> {
            self.ensure_todo_file()?;
            let text = fs::read_to_string(&self.todo_path)
                .map_err(|e| persist_err("loading todo file", e))?;
            Ok(text
                .lines()
                .map(|line| line.trim_end_matches('\r'))
                .filter(|line| !line.trim().is_empty())
                .map(|line| line.to_string())
                .collect())
        }

        fn store(&self, tasks: &[Task]) -> Result<(), TodoError> {
            Self::replace(&self.todo_path, &self.render(tasks))
                .map_err(|e| persist_err("storing todo file", e))
        }

        fn archive(&self, completed: &[Task], incomplete: &[Task]) -> Result<(), TodoError> {
            let mut done_contents = if self.done_path.exists() {
                fs::read_to_string(&self.done_path)
                    .map_err(|e| persist_err("loading done file", e))?
            } else {
                String::new()
            };
            if !done_contents.is_empty() && !done_contents.ends_with('\n') {
                done_contents.push_str(self.line_ending.as_str());
            }
            done_contents.push_str(&self.render(completed));

            // Stage both files before the first rename.
            let done_tmp = Self::stage(&self.done_path, &done_contents)
                .map_err(|e| persist_err("staging done file", e))?;
            let todo_tmp = Self::stage(&self.todo_path, &self.render(incomplete))
                .map_err(|e| persist_err("staging todo file", e))?;

            done_tmp
                .persist(&self.done_path)
                .map_err(|e| persist_err("replacing done file", e.error))?;
            todo_tmp
                .persist(&self.todo_path)
                .map_err(|e| persist_err("replacing todo file", e.error))?;
            Ok(())
        }
    }

    fn persist_err(action: &str, source: std::io::Error) -> TodoError {
        TodoError::Persist {
            action: action.to_string(),
            source,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::TaskId;
        use std::fs;

        fn task(id: u64, raw: &str) -> Task {
            Task::new(TaskId(id), raw)
        }

        #[test]
        fn load_creates_missing_file() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let todo = tmp.path().join("nested").join("todo.txt");
            let store = FileTaskStore::new(todo.clone(), tmp.path().join("done.txt"), LineEnding::Unix)
                .expect("store");
            assert!(todo.exists());
            assert!(store.load().expect("load").is_empty());
        }

        #[test]
        fn store_writes_one_line_per_task_in_order() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let store = FileTaskStore::new(
                tmp.path().join("todo.txt"),
                tmp.path().join("done.txt"),
                LineEnding::Unix,
            )
            .expect("store");

            store
                .store(&[task(0, "first"), task(1, "(A) second")])
                .expect("store tasks");

            let text = fs::read_to_string(tmp.path().join("todo.txt")).expect("read back");
            assert_eq!(text, "first\n(A) second\n");
            assert_eq!(store.load().expect("load"), vec!["first", "(A) second"]);
        }

        #[test]
        fn windows_line_endings_are_honored_and_reloaded() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let store = FileTaskStore::new(
                tmp.path().join("todo.txt"),
                tmp.path().join("done.txt"),
                LineEnding::Windows,
            )
            .expect("store");

            store.store(&[task(0, "crlf line")]).expect("store");
            let text = fs::read_to_string(tmp.path().join("todo.txt")).expect("read back");
            assert_eq!(text, "crlf line\r\n");
            assert_eq!(store.load().expect("load"), vec!["crlf line"]);
        }

        #[test]
        fn archive_appends_done_and_replaces_todo() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let done = tmp.path().join("done.txt");
            fs::write(&done, "x 2020-01-01 ancient history\n").expect("seed done");

            let store = FileTaskStore::new(tmp.path().join("todo.txt"), done.clone(), LineEnding::Unix)
                .expect("store");
            store
                .archive(
                    &[task(0, "x 2024-02-01 done1"), task(2, "x 2024-02-02 done2")],
                    &[task(1, "todo1")],
                )
                .expect("archive");

            let done_text = fs::read_to_string(&done).expect("done");
            assert_eq!(
                done_text,
                "x 2020-01-01 ancient history\nx 2024-02-01 done1\nx 2024-02-02 done2\n"
            );
            let todo_text = fs::read_to_string(tmp.path().join("todo.txt")).expect("todo");
            assert_eq!(todo_text, "todo1\n");
        }

        #[test]
        fn blank_lines_are_skipped_on_load() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let todo = tmp.path().join("todo.txt");
            fs::write(&todo, "one\n\n  \ntwo\n").expect("seed");
            let store =
                FileTaskStore::new(todo, tmp.path().join("done.txt"), LineEnding::Unix).expect("store");
            assert_eq!(store.load().expect("load"), vec!["one", "two"]);
        }
    }
}

pub mod repository {
    //! The ordered, mutable working set backed by a `TaskStore`. Not
    //! internally thread-safe: one logical owner mutates the list at a
    //! time and the caller serializes access.

    use std::collections::BTreeSet;

    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};

    use crate::core::{Priority, Task, TaskId, TodoError};
    use crate::storage::{LineEnding, TaskStore};

    /// Behavioral preferences carried by the repository.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ListPrefs {
        /// Stamp new tasks with the current date as a creation timestamp.
        pub prepend_date: bool,
        /// Insert new tasks at the tail (true) or the head (false).
        pub add_at_end: bool,
        pub line_ending: LineEnding,
    }

    impl Default for ListPrefs {
        fn default() -> Self {
            Self {
                prepend_date: true,
                add_at_end: true,
                line_ending: LineEnding::Unix,
            }
        }
    }

    pub struct TaskList<S: TaskStore> {
        backing: S,
        prefs: ListPrefs,
        tasks: Vec<Task>,

        // Aggregate views, computed lazily, dropped on any mutation.
        cached_priorities: Option<Vec<Priority>>,
        cached_contexts: Option<Vec<String>>,
        cached_projects: Option<Vec<String>>,
    }

    impl<S: TaskStore> TaskList<S> {
        pub fn new(backing: S, prefs: ListPrefs) -> TaskList<S> {
            TaskList {
                backing,
                prefs,
                tasks: vec![],
                cached_priorities: None,
                cached_contexts: None,
                cached_projects: None,
            }
        }

        pub fn prefs(&self) -> &ListPrefs {
            &self.prefs
        }

        fn invalidate(&mut self) {
            self.cached_priorities = None;
            self.cached_contexts = None;
            self.cached_projects = None;
        }

        /// Replace the in-memory sequence by re-parsing the backing store,
        /// reassigning identities by position. Cheap to call repeatedly.
        pub fn reload(&mut self) -> Result<(), TodoError> {
            self.invalidate();
            let lines = self.backing.load()?;
            self.tasks = lines
                .iter()
                .enumerate()
                .map(|(index, line)| Task::new(TaskId(index as u64), line))
                .collect();
            Ok(())
        }

        /// Serialize the in-memory sequence back to the backing store.
        pub fn store(&mut self) -> Result<(), TodoError> {
            self.invalidate();
            self.backing.store(&self.tasks)
        }

        pub fn size(&self) -> usize {
            self.tasks.len()
        }

        pub fn tasks(&self) -> &[Task] {
            &self.tasks
        }

        pub fn task_at(&self, position: usize) -> Option<&Task> {
            self.tasks.get(position)
        }

        pub fn find_by_id(&self, id: TaskId) -> Option<&Task> {
            self.tasks.iter().find(|t| t.id == id)
        }

        /// Mutable access to one task; drops the aggregate caches since the
        /// caller is about to change structural state.
        pub fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
            self.invalidate();
            self.tasks.iter_mut().find(|t| t.id == id)
        }

        /// Construct a task from raw text, stamp it per preference, insert
        /// at head or tail, and persist immediately. Blank input is the
        /// caller's concern; the repository stores what it is given.
        pub fn add_as_task(&mut self, input: &str, today: NaiveDate) -> Result<Task, TodoError> {
            let default_date = if self.prefs.prepend_date {
                Some(today)
            } else {
                None
            };
            let task = Task::with_default_date(TaskId(self.tasks.len() as u64), input, default_date);
            if self.prefs.add_at_end {
                self.tasks.push(task.clone());
            } else {
                self.tasks.insert(0, task.clone());
            }
            self.store()?;
            Ok(task)
        }

        /// Re-initialize the identified task in place and persist. Unknown
        /// ids are silently ignored (preserved behavior; see DESIGN.md).
        pub fn update_task(&mut self, id: TaskId, input: &str) -> Result<(), TodoError> {
            if let Some(position) = self.tasks.iter().position(|t| t.id == id) {
                self.tasks[position].update(input);
                self.store()?;
            }
            Ok(())
        }

        /// Remove the first value-equal element. Does not persist; callers
        /// batch deletions and then call `store()`.
        pub fn delete(&mut self, task: &Task) {
            if let Some(position) = self.tasks.iter().position(|t| t == task) {
                self.tasks.remove(position);
            }
            self.invalidate();
        }

        /// Move completed tasks to the done store: the completed subset is
        /// appended there, the remainder becomes the new sequence and is
        /// persisted. `to_archive` restricts the move to the given ids;
        /// `None` archives every completed task. The in-memory sequence is
        /// untouched when the store operation fails.
        pub fn archive(&mut self, to_archive: Option<&[TaskId]>) -> Result<usize, TodoError> {
            let selected = |task: &Task| {
                task.completed && to_archive.map_or(true, |ids| ids.contains(&task.id))
            };
            let completed: Vec<Task> = self.tasks.iter().filter(|t| selected(t)).cloned().collect();
            let incomplete: Vec<Task> =
                self.tasks.iter().filter(|t| !selected(t)).cloned().collect();

            self.backing.archive(&completed, &incomplete)?;
            self.tasks = incomplete;
            self.invalidate();
            Ok(completed.len())
        }

        /// Distinct priorities in ascending order (`None` last).
        pub fn get_priorities(&mut self) -> Vec<Priority> {
            let tasks = &self.tasks;
            self.cached_priorities
                .get_or_insert_with(|| {
                    let set: BTreeSet<Priority> = tasks.iter().map(|t| t.priority).collect();
                    set.into_iter().collect()
                })
                .clone()
        }

        /// Distinct contexts, lexicographically ascending. `include_none`
        /// prepends the `"-"` sentinel for "tasks without a context".
        pub fn get_contexts(&mut self, include_none: bool) -> Vec<String> {
            let tasks = &self.tasks;
            let base = self.cached_contexts.get_or_insert_with(|| {
                let set: BTreeSet<String> = tasks
                    .iter()
                    .flat_map(|t| t.contexts.iter().cloned())
                    .collect();
                set.into_iter().collect()
            });
            with_none_sentinel(base, include_none)
        }

        /// Distinct projects, same contract as `get_contexts`.
        pub fn get_projects(&mut self, include_none: bool) -> Vec<String> {
            let tasks = &self.tasks;
            let base = self.cached_projects.get_or_insert_with(|| {
                let set: BTreeSet<String> = tasks
                    .iter()
                    .flat_map(|t| t.projects.iter().cloned())
                    .collect();
                set.into_iter().collect()
            });
            with_none_sentinel(base, include_none)
        }
    }

    fn with_none_sentinel(base: &[String], include_none: bool) -> Vec<String> {
        let mut out = Vec::with_capacity(base.len() + 1);
        if include_none {
            out.push("-".to_string());
        }
        out.extend(base.iter().cloned());
        out
    }

}

pub mod filter {
    //! Pure display-order views over a task slice: predicate filters and
    //! comparator chains. Never mutates the collection.

    use std::cmp::Ordering;

    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};

    use crate::core::{Priority, Task};

    /// The sentinel entry standing for "no tag of this kind".
    pub const NONE_SENTINEL: &str = "-";

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TaskFilter {
        /// Matching contexts; `"-"` matches tasks without any context.
        pub contexts: Vec<String>,
        /// Matching projects; `"-"` matches tasks without any project.
        pub projects: Vec<String>,
        pub priorities: Vec<Priority>,
        pub hide_completed: bool,
        /// Hide tasks whose threshold date lies after `today`.
        pub hide_future: bool,
    }

    impl TaskFilter {
        pub fn matches(&self, task: &Task, today: NaiveDate) -> bool {
            if self.hide_completed && task.completed {
                return false;
            }
            if self.hide_future && task.in_future(today) {
                return false;
            }
            if !self.contexts.is_empty() && !tag_hit(&self.contexts, &task.contexts) {
                return false;
            }
            if !self.projects.is_empty() && !tag_hit(&self.projects, &task.projects) {
                return false;
            }
            if !self.priorities.is_empty() && !self.priorities.contains(&task.priority) {
                return false;
            }
            true
        }

        pub fn apply<'a>(&self, tasks: &'a [Task], today: NaiveDate) -> Vec<&'a Task> {
            tasks.iter().filter(|t| self.matches(t, today)).collect()
        }
    }

    fn tag_hit(wanted: &[String], present: &[String]) -> bool {
        wanted.iter().any(|tag| {
            if tag == NONE_SENTINEL {
                present.is_empty()
            } else {
                present.iter().any(|p| p == tag)
            }
        })
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum SortKey {
        FileOrder,
        Priority,
        Alphabetical,
        DueDate,
        ThresholdDate,
    }

    /// Sort by a comparator chain, tie-breaking on file position.
    pub fn sort_tasks(items: &mut [&Task], keys: &[SortKey]) {
        items.sort_by(|a, b| {
            for key in keys {
                let ord = match key {
                    SortKey::FileOrder => a.id.cmp(&b.id),
                    SortKey::Priority => a.priority.cmp(&b.priority),
                    SortKey::Alphabetical => {
                        a.text.to_lowercase().cmp(&b.text.to_lowercase())
                    }
                    SortKey::DueDate => cmp_optional_date(a.due_date, b.due_date),
                    SortKey::ThresholdDate => {
                        cmp_optional_date(a.threshold_date, b.threshold_date)
                    }
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.id.cmp(&b.id)
        });
    }

    /// Dated tasks sort before undated ones.
    fn cmp_optional_date(a: Option<NaiveDate>, b: Option<NaiveDate>) -> Ordering {
        match (a, b) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::TaskId;

        fn date(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
        }

        fn tasks() -> Vec<Task> {
            vec![
                Task::new(TaskId(0), "x 2024-01-05 (A) shipped +rel"),
                Task::new(TaskId(1), "(C) write docs @desk +rel due:2024-03-01"),
                Task::new(TaskId(2), "(A) fix bug @desk due:2024-02-01"),
                Task::new(TaskId(3), "idle thought"),
                Task::new(TaskId(4), "later t:2099-01-01"),
            ]
        }

        #[test]
        fn filter_by_context_and_sentinel() {
            let tasks = tasks();
            let today = date(2024, 1, 1);

            let desk = TaskFilter {
                contexts: vec!["desk".into()],
                ..TaskFilter::default()
            };
            let hits = desk.apply(&tasks, today);
            assert_eq!(hits.len(), 2);

            let untagged = TaskFilter {
                contexts: vec![NONE_SENTINEL.into()],
                ..TaskFilter::default()
            };
            let hits: Vec<_> = untagged
                .apply(&tasks, today)
                .iter()
                .map(|t| t.id)
                .collect();
            assert_eq!(hits, vec![TaskId(0), TaskId(3), TaskId(4)]);
        }

        #[test]
        fn hide_completed_and_future() {
            let tasks = tasks();
            let filter = TaskFilter {
                hide_completed: true,
                hide_future: true,
                ..TaskFilter::default()
            };
            let hits: Vec<_> = filter
                .apply(&tasks, date(2024, 1, 1))
                .iter()
                .map(|t| t.id)
                .collect();
            assert_eq!(hits, vec![TaskId(1), TaskId(2), TaskId(3)]);
        }

        #[test]
        fn filtering_never_mutates_the_input() {
            let tasks = tasks();
            let before: Vec<String> = tasks.iter().map(|t| t.in_file_format()).collect();
            let filter = TaskFilter {
                projects: vec!["rel".into()],
                ..TaskFilter::default()
            };
            let _ = filter.apply(&tasks, date(2024, 1, 1));
            let after: Vec<String> = tasks.iter().map(|t| t.in_file_format()).collect();
            assert_eq!(before, after);
        }

        #[test]
        fn priority_sort_with_id_tie_break() {
            let tasks = tasks();
            let mut view: Vec<&Task> = tasks.iter().collect();
            sort_tasks(&mut view, &[SortKey::Priority]);
            let ids: Vec<TaskId> = view.iter().map(|t| t.id).collect();
            // A before C before unprioritized; the completed task keeps its
            // old priority in the body, so it counts as unprioritized here.
            assert_eq!(
                ids,
                vec![TaskId(2), TaskId(1), TaskId(0), TaskId(3), TaskId(4)]
            );
        }

        #[test]
        fn due_date_sort_puts_undated_last() {
            let tasks = tasks();
            let mut view: Vec<&Task> = tasks.iter().collect();
            sort_tasks(&mut view, &[SortKey::DueDate]);
            let ids: Vec<TaskId> = view.iter().map(|t| t.id).collect();
            assert_eq!(
                ids,
                vec![TaskId(2), TaskId(1), TaskId(0), TaskId(3), TaskId(4)]
            );
        }

        #[test]
        fn chained_sort_applies_in_order() {
            let tasks = vec![
                Task::new(TaskId(0), "(B) beta"),
                Task::new(TaskId(1), "(A) zulu"),
                Task::new(TaskId(2), "(A) alpha"),
            ];
            let mut view: Vec<&Task> = tasks.iter().collect();
            sort_tasks(&mut view, &[SortKey::Priority, SortKey::Alphabetical]);
            let ids: Vec<TaskId> = view.iter().map(|t| t.id).collect();
            assert_eq!(ids, vec![TaskId(2), TaskId(1), TaskId(0)]);
        }
    }
}

pub use crate::core::{Priority, Task, TaskId, TodoError, valid_tag};
pub use filter::{SortKey, TaskFilter, sort_tasks};
pub use format::{in_file_format, in_screen_format};
pub use parser::parse_task_line;
pub use repository::{ListPrefs, TaskList};
pub use storage::{FileTaskStore, LineEnding, TaskStore};
