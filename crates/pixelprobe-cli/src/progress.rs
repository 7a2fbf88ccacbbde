//! Terminal progress bar fed by run events.

use indicatif::{ProgressBar, ProgressStyle};
use pixelprobe::{ProbeEvent, ProbeEventReceiver};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Draw a progress bar until the run finishes or the channel closes.
pub fn spawn(mut rx: ProbeEventReceiver) -> JoinHandle<()> {
    tokio::spawn(async move {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:30} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        loop {
            match rx.recv().await {
                Ok(ProbeEvent::RunStarted { sites }) => bar.set_length(sites as u64),
                Ok(ProbeEvent::SiteStarted { site, .. }) => bar.set_message(site),
                Ok(ProbeEvent::SiteFinished { site, error, .. }) => {
                    if let Some(error) = error {
                        bar.println(format!("{site}: {error}"));
                    }
                    bar.inc(1);
                }
                Ok(ProbeEvent::RunFinished { sites, failed, .. }) => {
                    bar.finish_with_message(format!("{sites} sites, {failed} with errors"));
                    break;
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => {
                    bar.abandon();
                    break;
                }
            }
        }
    })
}
