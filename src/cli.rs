use crate::manager::TransferManager;
use crate::progress::ProgressDisplay;
use crate::task::TransferTask;
use bytesize::ByteSize;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Pause one task, or every task when no tag is given.
    Pause(Option<String>),
    Start(Option<String>),
    Restart(String),
    Remove { tag: String, delete_file: bool },
    List(Option<String>),
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let verb = parts.next().ok_or_else(|| "empty command".to_string())?;
        let tag = parts.next().map(str::to_string);
        let flag = parts.next();

        match verb.to_lowercase().as_str() {
            "pause" => Ok(Command::Pause(tag)),
            "start" | "resume" => Ok(Command::Start(tag)),
            "restart" => tag
                .map(Command::Restart)
                .ok_or_else(|| "usage: restart <tag>".to_string()),
            "remove" => tag
                .map(|tag| Command::Remove {
                    tag,
                    delete_file: matches!(flag, Some("--delete" | "-d")),
                })
                .ok_or_else(|| "usage: remove <tag> [--delete]".to_string()),
            "list" | "ls" => Ok(Command::List(tag)),
            "help" | "?" => Ok(Command::Help),
            "quit" | "exit" | "q" => Ok(Command::Quit),
            other => Err(format!("Unknown command: {}", other)),
        }
    }
}

/// Reads commands from stdin and applies them to the manager's tasks.
pub struct InteractiveMode {
    manager: Arc<TransferManager>,
    display: Arc<ProgressDisplay>,
}

impl InteractiveMode {
    pub fn new(manager: Arc<TransferManager>, display: Arc<ProgressDisplay>) -> Self {
        Self { manager, display }
    }

    /// Runs until `quit` or end of input.
    pub async fn run(&self) {
        let mut stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let mut line = String::new();

        loop {
            line.clear();
            match stdin.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    self.display.println(format!("Failed to read input: {}", e));
                    break;
                }
            }
            if line.trim().is_empty() {
                continue;
            }

            match line.trim().parse::<Command>() {
                Ok(Command::Quit) => break,
                Ok(command) => self.handle_command(command).await,
                Err(e) => self.display.println(e),
            }
        }
    }

    async fn handle_command(&self, command: Command) {
        let result = match command {
            Command::Pause(None) => {
                self.manager.pause_all().await;
                Ok(())
            }
            Command::Pause(Some(tag)) => match self.task(&tag) {
                Some(task) => task.pause().await,
                None => return,
            },
            Command::Start(None) => {
                self.manager.start_all().await;
                Ok(())
            }
            Command::Start(Some(tag)) => match self.task(&tag) {
                Some(task) => task.start().await,
                None => return,
            },
            Command::Restart(tag) => match self.task(&tag) {
                Some(task) => task.restart().await,
                None => return,
            },
            Command::Remove { tag, delete_file } => match self.task(&tag) {
                Some(task) => task.remove(delete_file).await,
                None => return,
            },
            Command::List(tag) => {
                self.list(tag.as_deref());
                Ok(())
            }
            Command::Help => {
                self.display.println(
                    "commands: pause [tag] | start [tag] | restart <tag> | remove <tag> [--delete] | list [tag] | quit",
                );
                Ok(())
            }
            Command::Quit => Ok(()),
        };

        if let Err(e) = result {
            self.display.println(format!("Command failed: {}", e));
        }
    }

    fn task(&self, tag: &str) -> Option<Arc<TransferTask>> {
        let task = self.manager.get_task(tag);
        if task.is_none() {
            self.display.println(format!("No task with tag {}", tag));
        }
        task
    }

    fn list(&self, tag: Option<&str>) {
        let tasks = match tag {
            Some(tag) => self.task(tag).into_iter().collect(),
            None => self.manager.all_tasks(),
        };
        if tasks.is_empty() {
            self.display.println("No tasks");
        }
        for task in tasks {
            let record = task.record();
            let total = if record.has_known_total() {
                ByteSize::b(record.total_size as u64).to_string()
            } else {
                "?".to_string()
            };
            self.display.println(format!(
                "{:<16} {:<8} {:>6.1}% {:>10}/{:<10} prio={} {}",
                record.tag,
                record.status,
                record.fraction * 100.0,
                ByteSize::b(record.current_size.max(0) as u64).to_string(),
                total,
                record.priority,
                record.file_path.as_deref().unwrap_or(&record.url)
            ));
        }
    }
}
