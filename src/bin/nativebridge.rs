//! nativebridge - call native functions described by JSON type descriptors

use clap::{Parser, Subcommand};
use nativebridge::{create_ref, start_with, stop, Argument, EngineConfig, StartOptions, TypeDescriptor, Value};
use serde::Deserialize;
use serde_json::{json, Map, Number};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "nativebridge")]
#[command(about = "Dynamic foreign-call marshaling engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to nativebridge.toml discovery)
    #[arg(short, long, global = true, value_name = "CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Call a native function and print its result as JSON
    Call {
        /// Library name, alias or path
        library: String,

        /// Exported symbol
        symbol: String,

        /// Arguments: [{"type": <descriptor>, "value": ..., "optional": bool}]
        #[arg(short, long, default_value = "[]")]
        args: String,

        /// Return descriptor
        #[arg(short, long, default_value = r#"{"type":"void"}"#)]
        returns: String,

        /// Application id the engine is started with
        #[arg(long, default_value = "org.nativebridge.Cli")]
        application_id: String,
    },

    /// Check that a descriptor is well formed
    Validate {
        /// Descriptor JSON
        descriptor: String,
    },

    /// Print the default configuration
    Config,
}

#[derive(Deserialize)]
struct JsonArgument {
    #[serde(rename = "type")]
    descriptor: TypeDescriptor,
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default)]
    optional: bool,
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Call {
            library,
            symbol,
            args,
            returns,
            application_id,
        } => load_config(cli.config.as_ref())
            .and_then(|config| run_call(config, &application_id, &library, &symbol, &args, &returns)),
        Commands::Validate { descriptor } => validate(&descriptor),
        Commands::Config => {
            print!("{}", EngineConfig::generate_default());
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig, String> {
    match path {
        Some(path) => EngineConfig::load(path).map_err(|e| e.to_string()),
        None => Ok(EngineConfig::discover()),
    }
}

fn run_call(
    config: EngineConfig,
    application_id: &str,
    library: &str,
    symbol: &str,
    args: &str,
    returns: &str,
) -> Result<(), String> {
    let parsed: Vec<JsonArgument> =
        serde_json::from_str(args).map_err(|e| format!("invalid argument list: {}", e))?;
    let return_type: TypeDescriptor =
        serde_json::from_str(returns).map_err(|e| format!("invalid return descriptor: {}", e))?;

    let arguments: Vec<Argument> = parsed.into_iter().map(to_argument).collect();

    start_with(application_id, StartOptions::new().with_config(config)).map_err(|e| e.to_string())?;
    let outcome = nativebridge::call(library, symbol, &arguments, &return_type);
    let output = outcome.map(|value| {
        let out: Vec<serde_json::Value> = arguments
            .iter()
            .filter_map(|arg| arg.value.as_ref_cell())
            .map(|cell| to_json(&cell.get()))
            .collect();
        json!({ "result": to_json(&value), "out": out })
    });
    drop(arguments);
    stop();

    let output = output.map_err(|e| e.to_string())?;
    println!("{}", serde_json::to_string_pretty(&output).map_err(|e| e.to_string())?);
    Ok(())
}

fn validate(descriptor: &str) -> Result<(), String> {
    let ty: TypeDescriptor = serde_json::from_str(descriptor).map_err(|e| e.to_string())?;
    ty.validate().map_err(|e| e.to_string())?;
    println!(
        "{}: {} slot(s) {:?}",
        ty,
        ty.slot_count(),
        ty.slot_types().as_slice()
    );
    Ok(())
}

/// References get a fresh cell holding the JSON value
fn to_argument(arg: JsonArgument) -> Argument {
    let value = from_json(&arg.value);
    let value = match arg.descriptor {
        TypeDescriptor::Reference { .. } => Value::Ref(create_ref(value)),
        _ => value,
    };
    Argument {
        descriptor: arg.descriptor,
        value,
        optional: arg.optional,
    }
}

fn from_json(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i as i128)
            } else if let Some(u) = n.as_u64() {
                Value::Int(u as i128)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => Value::Array(items.iter().map(from_json).collect()),
        serde_json::Value::Object(map) => Value::Map(
            map.iter()
                .map(|(k, v)| (Value::String(k.clone()), from_json(v)))
                .collect(),
        ),
    }
}

fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => i64::try_from(*i)
            .map(Number::from)
            .or_else(|_| u64::try_from(*i).map(Number::from))
            .map_or_else(|_| json!(i.to_string()), serde_json::Value::Number),
        Value::Float(f) => Number::from_f64(*f).map_or(serde_json::Value::Null, serde_json::Value::Number),
        Value::String(s) => json!(s),
        Value::Pointer(address) => json!(format!("{:#x}", address)),
        Value::Object(object) => json!({ "object": format!("{:#x}", object.address()) }),
        Value::Boxed(boxed) => json!({
            "boxed": boxed.type_name(),
            "address": format!("{:#x}", boxed.address()),
        }),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
        Value::Map(pairs) => {
            let mut map = Map::new();
            for (k, v) in pairs {
                let key = match k {
                    Value::String(s) => s.clone(),
                    other => to_json(other).to_string(),
                };
                map.insert(key, to_json(v));
            }
            serde_json::Value::Object(map)
        }
        Value::Ref(cell) => to_json(&cell.get()),
        Value::Callback(_) => json!("<callback>"),
    }
}
