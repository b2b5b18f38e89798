use std::cell::Cell;
use std::path::PathBuf;
use std::process;
use std::rc::Rc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use strum::IntoEnumIterator;
use strum_macros::{AsRefStr, Display, EnumIter};
use tracing::{debug, info, warn};
use workerport::{
    ErrorEvent, EventLoop, RegistryLoader, Runtime, RuntimeConfig, Thrown, WorkerOptions,
    logger::init_tracing,
};

#[derive(Parser, Debug)]
#[command(
    name = "workerport",
    about = "Run scripts on worker threads with ordered message ports",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one of the built-in demo scripts on a worker thread
    Demo(DemoArgs),

    /// List the built-in demos
    List,
}

#[derive(Args, Debug)]
struct DemoArgs {
    name: Demo,

    /// Text fed to the worker's stdin (stdin is closed immediately without it)
    #[arg(long)]
    stdin: Option<String>,

    /// Log level or EnvFilter directive (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write logs to a daily rolling file in this directory instead of stderr
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Display, AsRefStr, EnumIter)]
#[strum(serialize_all = "lowercase")]
enum Demo {
    /// Copies stdin to stdout and reports the byte count
    Echo,
    /// Answers every ping on the parent port until told "done"
    Ping,
    /// Fails right away with an uncaught error
    Crash,
}

impl Demo {
    fn describe(self) -> &'static str {
        match self {
            Demo::Echo => "copies stdin to stdout and reports the byte count",
            Demo::Ping => "answers pings on the parent port until told \"done\"",
            Demo::Crash => "fails right away with an uncaught error",
        }
    }
}

fn demo_loader(config: &RuntimeConfig) -> RegistryLoader {
    let loader = RegistryLoader::from_config(config);
    loader.register_eval(Demo::Echo.as_ref(), |scope| {
        let out = scope.stdout();
        let total = Rc::new(Cell::new(0usize));
        let seen = total.clone();
        scope.stdin().on_data(move |chunk| {
            seen.set(seen.get() + chunk.len());
            if let Err(err) = out.write(chunk.to_vec()) {
                warn!(%err, "echo write failed");
            }
        });
        let reply = scope.clone();
        scope.stdin().on_end(move || {
            if let Err(err) = reply.post(json!({ "echoed": total.get() })) {
                warn!(%err, "echo could not report");
            }
        });
        Ok(())
    });
    loader.register_eval(Demo::Ping.as_ref(), |scope| {
        let listener = Rc::new(Cell::new(None));
        let slot = listener.clone();
        let replies = scope.clone();
        let id = scope.on_message(move |ev| {
            if ev.data == json!("done") {
                if let Some(id) = slot.get() {
                    replies.off(id);
                }
                return;
            }
            if let Err(err) = replies.post(json!({ "pong": ev.data["ping"] })) {
                warn!(%err, "ping could not reply");
            }
        })?;
        listener.set(Some(id));
        Ok(())
    });
    loader.register_eval(Demo::Crash.as_ref(), |_| {
        Err(Thrown::from(anyhow::anyhow!("boom from the crash demo")))
    });
    loader
}

fn run_demo(args: DemoArgs) -> anyhow::Result<i32> {
    let _guard = init_tracing(&args.log_level, args.log_dir.as_deref())?;
    let config = RuntimeConfig::from_env();
    let runtime = Runtime::new(demo_loader(&config), config);
    let exit_code = Rc::new(Cell::new(0));
    let demo = args.name;

    let code = exit_code.clone();
    EventLoop::run_main(move || -> anyhow::Result<()> {
        let options = WorkerOptions {
            stdin: args.stdin.is_some(),
            ..WorkerOptions::eval()
        };
        let worker = runtime.spawn(demo.as_ref(), options)?;
        let thread_id = worker.thread_id().unwrap_or_default();
        info!(thread_id, %demo, "spawned demo worker");

        worker.on_online(move || info!(thread_id, "worker online"));
        worker.on_message(|ev| println!("message: {}", ev.data));
        worker.on_error(|err| match err {
            ErrorEvent::Thrown(remote) => {
                eprintln!("error: {}", remote.message().unwrap_or("<non-string value>"))
            }
            ErrorEvent::Unserializable => eprintln!("error: <unserializable>"),
        });
        worker.on_close(|| debug!("public channel closed"));
        worker.on_exit(move |c| {
            println!("exit: {c}");
            code.set(c);
        });

        if let Some(text) = &args.stdin {
            let stdin = worker.stdin().context("worker was spawned without stdin")?;
            stdin.write_str(text)?;
            stdin.end()?;
        }
        if demo == Demo::Ping {
            for i in 0..3 {
                worker.post(json!({ "ping": i }))?;
            }
            worker.post("done")?;
        }
        Ok(())
    })??;

    Ok(exit_code.get())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Demo(args) => {
            let code = run_demo(args)?;
            process::exit(code);
        }
        Commands::List => {
            for demo in Demo::iter() {
                println!("{demo:<6} {}", demo.describe());
            }
            Ok(())
        }
    }
}
