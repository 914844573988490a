//! Test-harness verbs.
//!
//! Verbs registered here are matched before the regular command surface.
//! Each entry declares how many positional arguments it takes; a call with
//! any other count prints the entry's usage instead of running. Verbs the
//! table does not know fall through to the clap parser untouched.

/// What a harness verb does once its arguments check out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessAction {
    CreateTest,
    VerifyTest,
}

#[derive(Debug, Clone)]
pub struct HarnessCommand {
    pub verb: &'static str,
    pub usage: &'static str,
    pub summary: &'static str,
    pub arity: usize,
    pub action: HarnessAction,
}

/// Outcome of matching a command line against the table.
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    Run { action: HarnessAction, args: Vec<String> },
    Usage(&'static str),
    FallThrough,
}

#[derive(Debug, Default)]
pub struct CommandTable {
    entries: Vec<HarnessCommand>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The table `provisorctl` ships with.
    pub fn with_service_tests() -> Self {
        let mut table = Self::new();
        table.register(HarnessCommand {
            verb: "create-test",
            usage: "provisorctl create-test <appname>",
            summary: "Provision and bind every test service for an app",
            arity: 1,
            action: HarnessAction::CreateTest,
        });
        table.register(HarnessCommand {
            verb: "verify-test",
            usage: "provisorctl verify-test <appname>",
            summary: "Verify the app's test services and bindings",
            arity: 1,
            action: HarnessAction::VerifyTest,
        });
        table
    }

    /// Add a verb. A later registration of the same verb replaces the earlier one.
    pub fn register(&mut self, command: HarnessCommand) {
        self.entries.retain(|c| c.verb != command.verb);
        self.entries.push(command);
    }

    /// Match `args` (without the program name).
    pub fn dispatch(&self, args: &[String]) -> Dispatch {
        let Some((verb, rest)) = args.split_first() else {
            return Dispatch::FallThrough;
        };
        match self.entries.iter().find(|c| c.verb == verb) {
            Some(command) if rest.len() == command.arity => Dispatch::Run {
                action: command.action,
                args: rest.to_vec(),
            },
            Some(command) => Dispatch::Usage(command.usage),
            None => Dispatch::FallThrough,
        }
    }

    /// Help section appended to the regular `--help` output.
    pub fn help_section(&self) -> String {
        let mut out = String::from("Service Test:\n");
        for command in &self.entries {
            let synopsis = command.usage.trim_start_matches("provisorctl ");
            out.push_str(&format!("  {synopsis:<32} {}\n", command.summary));
        }
        out
    }
}
