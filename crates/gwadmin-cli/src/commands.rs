//! Parsing of console commands.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login { remember_me: bool },
    Logout,
    WhoAmI,
    Services { search: Option<String> },
    Service { id: String },
    Routes { service_id: String },
    Route { id: String },
    DeleteService { id: String },
    DeleteRoute { id: String },
    Help,
    Quit,
}

pub const HELP: &str = "\
Commands:
  login [--remember]      sign in (--remember keeps the session across restarts)
  logout                  sign out and forget stored credentials
  whoami                  show the signed-in user
  services [search]       list services, optionally filtered
  service <id>            show one service
  routes <service-id>     list routes of a service
  route <id>              show one route
  delete-service <id>     delete a service
  delete-route <id>       delete a route
  help                    show this help
  quit                    leave the console";

/// Parse one input line. `Ok(None)` for blank lines.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let mut parts = line.split_whitespace();
    let Some(name) = parts.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = parts.collect();

    let required = |what: &str| -> Result<String, String> {
        match args.as_slice() {
            [value] => Ok(value.to_string()),
            _ => Err(format!("usage: {} <{}>", name, what)),
        }
    };

    let command = match name {
        "login" => match args.as_slice() {
            [] => Command::Login { remember_me: false },
            ["--remember"] | ["-r"] => Command::Login { remember_me: true },
            _ => return Err("usage: login [--remember]".to_string()),
        },
        "logout" => Command::Logout,
        "whoami" => Command::WhoAmI,
        "services" => Command::Services {
            search: (!args.is_empty()).then(|| args.join(" ")),
        },
        "service" => Command::Service { id: required("id")? },
        "routes" => Command::Routes {
            service_id: required("service-id")?,
        },
        "route" => Command::Route { id: required("id")? },
        "delete-service" => Command::DeleteService { id: required("id")? },
        "delete-route" => Command::DeleteRoute { id: required("id")? },
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command '{}', try 'help'", other)),
    };
    Ok(Some(command))
}
