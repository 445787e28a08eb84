use clap::{App, Arg};
use std::env;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process;
use wisp::config::Config;
use wisp::core::Core;
use wisp::logging;

/// Default data directory name under the user's home directory.
const CORE_DEFAULT_DIR: &str = ".wisp";

pub fn main() {
    let matches = App::new("Wisp Core")
        .version("0.1.0")
        .about("Runs the wisp peer-to-peer core node.")
        .arg(
            Arg::with_name("no-broadcast")
                .short("b")
                .long("no-broadcast")
                .help("Don't advertise own identities over local discovery"),
        )
        .arg(
            Arg::with_name("no-listen")
                .short("l")
                .long("no-listen")
                .help("Don't listen to local discovery broadcasts"),
        )
        .arg(
            Arg::with_name("no-accept")
                .short("S")
                .long("no-accept")
                .help("Only open connections, don't accept incoming ones"),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .takes_value(true)
                .value_name("PORT")
                .help("Listen for incoming wish connections at this TCP port"),
        )
        .arg(
            Arg::with_name("relay")
                .short("r")
                .long("relay")
                .help("Maintain a relay control session for accepting punched inbound connections"),
        )
        .arg(
            Arg::with_name("app-port")
                .short("a")
                .long("app-port")
                .takes_value(true)
                .value_name("PORT")
                .help("Start the app IPC server at this TCP port"),
        )
        .arg(
            Arg::with_name("local-dir")
                .short("d")
                .long("local-dir")
                .help("Use the current working directory for database files"),
        )
        .arg(
            Arg::with_name("new-identity")
                .short("n")
                .long("new-identity")
                .takes_value(true)
                .value_name("ALIAS")
                .help("Create a local identity with this alias before starting"),
        )
        .get_matches();

    let log = logging::init();

    let directory = if matches.is_present("local-dir") {
        env::current_dir().expect("Error reading working directory")
    } else {
        let home = env::var("HOME").expect("HOME is not set");
        let path = PathBuf::from(home).join(CORE_DEFAULT_DIR);
        if !path.exists() {
            fs::create_dir_all(&path).expect("Error creating core data directory");
            fs::set_permissions(&path, fs::Permissions::from_mode(0o700))
                .expect("Error restricting core data directory");
        }
        path
    };

    let mut config = Config::load(&directory);

    if matches.is_present("no-broadcast") {
        config.advertise = false;
    }
    if matches.is_present("no-listen") {
        config.discover = false;
    }
    if matches.is_present("no-accept") {
        config.accept = false;
    }
    if matches.is_present("relay") {
        config.relay = true;
    }
    if let Some(port) = matches.value_of("port") {
        config.port = port.parse().unwrap_or_else(|_| {
            eprintln!("Invalid wish port: {}", port);
            process::exit(1);
        });
    }
    if let Some(port) = matches.value_of("app-port") {
        config.app_port = port.parse().unwrap_or_else(|_| {
            eprintln!("Invalid app port: {}", port);
            process::exit(1);
        });
        config.app_server = true;
    }

    let mut core = match Core::new(config, &directory, &log) {
        Ok(core) => core,
        Err(err) => {
            logging::error!(log, "startup failed"; "error" => %err);
            process::exit(1);
        }
    };

    if let Some(alias) = matches.value_of("new-identity") {
        match core.create_identity(alias) {
            Ok(identity) => {
                logging::info!(log, "created local identity"; "alias" => &identity.alias)
            }
            Err(err) => {
                logging::error!(log, "identity creation failed"; "error" => ?err);
                process::exit(1);
            }
        }
    }

    logging::info!(log, "wisp core started"; "dir" => %directory.display());

    loop {
        core.tick();
    }
}
