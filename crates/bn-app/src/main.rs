use std::sync::Arc;
use bn_app::api::HttpJobApi;
use bn_app::config::TrackerConfig;
use bn_app::events::TrackerEvent;
use bn_app::notify::LogNotifier;
use bn_app::tracker::JobTracker;
use bn_core::DesignRequest;
use log::info;
use tokio::sync::mpsc;

const USAGE: &str = "usage: bn-app [--style STYLE] [--room ROOM_TYPE] <prompt...>";

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<DesignRequest> {
    let mut style = None;
    let mut room_type = None;
    let mut words = Vec::new();

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--style" => style = Some(args.next().ok_or_else(|| anyhow::anyhow!("--style needs a value\n{}", USAGE))?),
            "--room" => room_type = Some(args.next().ok_or_else(|| anyhow::anyhow!("--room needs a value\n{}", USAGE))?),
            _ => words.push(arg),
        }
    }

    anyhow::ensure!(!words.is_empty(), USAGE);

    let mut request = DesignRequest::new(words.join(" "));
    request.style = style;
    request.room_type = room_type;
    Ok(request)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let request = parse_args(std::env::args().skip(1))?;
    let config = TrackerConfig::load()?;
    info!("Using design service at {}", config.api_url);

    let api = Arc::new(HttpJobApi::<DesignRequest>::from_config(&config)?);
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let tracker = JobTracker::new(api, config.settings(), events_tx, Arc::new(LogNotifier));

    tracker.submit(request).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracker.cancel();
                info!("Cancelled by user");
                return Ok(());
            }
            event = events.recv() => match event {
                Some(TrackerEvent::JobComplete(job)) => {
                    let payload = job.result_payload().cloned().unwrap_or_default();
                    println!("{}", serde_json::to_string_pretty(&payload)?);
                    return Ok(());
                }
                Some(TrackerEvent::JobFailed(job)) => {
                    anyhow::bail!("Design generation failed: {}", job.error_message().unwrap_or_default());
                }
                Some(event) => info!("Job is {}", event.job().status().label()),
                None => return Ok(()),
            }
        }
    }
}
