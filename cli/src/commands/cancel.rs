use scanfleet_common::job::CancelRequest;
use scanfleet_core::intake::CancelBroadcast;

use crate::commands::CancelArgs;
use crate::terminal::print;

pub async fn cancel(redis_url: &str, args: CancelArgs) -> anyhow::Result<()> {
    let broadcast = CancelBroadcast::new(redis_url, &args.queues.cancel_channel)?;
    let request = CancelRequest::new(args.job_ids);
    let receivers: usize = broadcast.publish(&request).await?;

    print::aligned_line("Jobs", request.job_ids.join(", "));
    print::aligned_line("Workers reached", receivers);
    Ok(())
}
