use scopewire_buffer::select_fetcher;
use scopewire_rpc::Reply;
use serde_json::{Map, Value};

use crate::cmd::{connect, parse_duration, CallArgs};
use crate::exit::{buffer_error, fault_error, rpc_error, CliError, CliResult, DATA_INVALID, SUCCESS};
use crate::output::{print_array, print_binary, print_value, OutputFormat};

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let config = args.endpoints.resolve()?;
    let timeout = parse_duration(&args.timeout)?;
    let positional = parse_args(args.args.as_deref())?;
    let keywords = parse_kwargs(args.kwargs.as_deref())?;
    let mut client = connect(&config, Some(timeout))?;

    if args.fetch {
        let fetcher = select_fetcher(&client, args.remote);
        let array = fetcher
            .fetch(&mut client, &args.path, positional, keywords)
            .map_err(|err| buffer_error(&format!("fetch {} failed", args.path), err))?;
        print_array(&array, fetcher.name(), format);
        return Ok(SUCCESS);
    }

    let reply = client
        .call(&args.path, positional, keywords)
        .map_err(|err| rpc_error(&format!("call {} failed", args.path), err))?;
    match reply {
        Reply::Value(value) => print_value(&value, format),
        Reply::Binary(data) => print_binary(&data, format),
        Reply::Error(fault) => return Err(fault_error(&args.path, &fault)),
    }
    Ok(SUCCESS)
}

fn parse_args(text: Option<&str>) -> CliResult<Vec<Value>> {
    match text.map(serde_json::from_str::<Value>).transpose() {
        Ok(None) => Ok(Vec::new()),
        Ok(Some(Value::Array(items))) => Ok(items),
        Ok(Some(single)) => Ok(vec![single]),
        Err(err) => Err(CliError::new(DATA_INVALID, format!("--args is not JSON: {err}"))),
    }
}

fn parse_kwargs(text: Option<&str>) -> CliResult<Map<String, Value>> {
    match text.map(serde_json::from_str::<Value>).transpose() {
        Ok(None) => Ok(Map::new()),
        Ok(Some(Value::Object(map))) => Ok(map),
        Ok(Some(_)) => Err(CliError::new(DATA_INVALID, "--kwargs must be a JSON object")),
        Err(err) => Err(CliError::new(DATA_INVALID, format!("--kwargs is not JSON: {err}"))),
    }
}
