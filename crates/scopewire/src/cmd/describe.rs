use scopewire_socket::matches_prefix;

use crate::cmd::{connect, DescribeArgs};
use crate::exit::{rpc_error, CliResult, SUCCESS};
use crate::output::{print_descriptors, OutputFormat};

pub fn run(args: DescribeArgs, format: OutputFormat) -> CliResult<i32> {
    let config = args.endpoints.resolve()?;
    let mut client = connect(&config, None)?;
    let mut descriptors = client
        .describe()
        .map_err(|err| rpc_error("describe failed", err))?;
    if let Some(prefix) = &args.prefix {
        descriptors.retain(|d| matches_prefix(prefix, &d.path));
    }
    descriptors.sort_by(|a, b| a.path.cmp(&b.path));
    print_descriptors(&descriptors, format);
    Ok(SUCCESS)
}
