use anyhow::{anyhow, Result};
use clap::Parser;

use darkroast::loader::DirLoader;
use darkroast::{Value, Vm};

#[derive(Parser)]
#[command(name = "darkroast")]
#[command(about = "A metacircular JVM that interprets class files")]
struct Args {
    /// Directory searched for <name>.class files
    #[arg(long, default_value = ".")]
    classpath: String,

    /// Internal name of the class to run (slash form)
    class: String,

    /// Method to invoke
    #[arg(default_value = "main")]
    method: String,

    /// Integer arguments passed to the method
    #[arg(long, value_delimiter = ',')]
    int_args: Vec<i32>,

    /// Print the live heap after the run
    #[arg(long)]
    dump_heap: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        std::env::var("DARKROAST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut vm = Vm::new(Box::new(DirLoader::new(&args.classpath)))
        .with_log(|line| eprintln!("[vm] {line}"));

    let values = args.int_args.iter().copied().map(Value::Int).collect();
    let result = vm
        .invoke(&args.class, &args.method, values)
        .map_err(|e| anyhow!("{e}"))?;

    match result {
        Value::Void => {}
        Value::Ref(reference) => match vm.read_string(reference) {
            Ok(text) => println!("{text}"),
            Err(_) => println!("reference {reference}"),
        },
        other => println!("{other:?}"),
    }

    if args.dump_heap {
        println!("{}", vm.heap_dump());
    }
    Ok(())
}
