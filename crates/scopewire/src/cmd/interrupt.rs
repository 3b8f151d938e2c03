use scopewire::config::Service;
use scopewire_rpc::InterruptRequest;
use scopewire_socket::PushSocket;

use crate::cmd::InterruptArgs;
use crate::exit::{socket_error, CliError, CliResult, INTERNAL, SUCCESS};

pub fn run(args: InterruptArgs) -> CliResult<i32> {
    let config = args.endpoints.resolve()?;
    let endpoint = config.endpoint(Service::Interrupt);
    let mut push = PushSocket::connect(&endpoint)
        .map_err(|err| socket_error(&format!("connect to {endpoint} failed"), err))?;
    let payload = serde_json::to_vec(&InterruptRequest {
        call_id: args.call_id,
    })
    .map_err(|err| CliError::new(INTERNAL, format!("encode failed: {err}")))?;
    push.send(&[&payload])
        .map_err(|err| socket_error("interrupt not sent", err))?;
    Ok(SUCCESS)
}
