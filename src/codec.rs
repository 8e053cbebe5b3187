//! Missing codec handling.
//!
//! When the pipeline reports a missing codec, the host may be able to
//! install it. While an installation runs, engine errors are not shown to
//! the user. A successful installation still needs the element graph to be
//! rebuilt, so it is reported as fatal and the stream must be restarted
//! rather than retried in place. Without an installer the condition is
//! recoverable: the user can pick another audio quality.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::events::Event;

/// Result of an installation attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    Failed(String),
}

/// Host capability to install codecs on demand.
pub trait CodecInstaller: Send + Sync {
    /// Whether automatic installation is possible at all on this host.
    fn is_supported(&self) -> bool;

    /// Installs codecs for the given descriptions.
    fn install(&self, descriptions: Vec<String>) -> BoxFuture<'static, InstallOutcome>;
}

/// Tracks installations and turns missing-codec reports into events.
pub struct Codecs {
    installer: Option<Arc<dyn CodecInstaller>>,
    in_progress: bool,
    tx: mpsc::UnboundedSender<InstallOutcome>,
    rx: mpsc::UnboundedReceiver<InstallOutcome>,
}

impl Default for Codecs {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Codecs {
    #[must_use]
    pub fn new(installer: Option<Arc<dyn CodecInstaller>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            installer,
            in_progress: false,
            tx,
            rx,
        }
    }

    /// Whether an installation is running. Engine errors are suppressed
    /// meanwhile.
    #[must_use]
    pub fn is_installing(&self) -> bool {
        self.in_progress
    }

    /// Handles a missing codec report.
    ///
    /// Starts an installation in the background when the host supports it
    /// and returns `None`; otherwise returns the recoverable error to
    /// surface.
    pub fn missing(&mut self, description: String) -> Option<Event> {
        let installer = match &self.installer {
            Some(installer) if installer.is_supported() => Arc::clone(installer),
            _ => {
                warn!("missing codec: {description}");
                return Some(Event::Error(format!(
                    "Missing codec for {description}. Try a different audio quality."
                )));
            }
        };

        if self.in_progress {
            debug!("codec installation already running, not requesting {description}");
            return None;
        }

        info!("installing missing codec: {description}");
        self.in_progress = true;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let outcome = installer.install(vec![description]).await;
            // The receiver lives as long as the player.
            let _ = tx.send(outcome);
        });

        None
    }

    /// Waits for the running installation to finish.
    pub async fn completed(&mut self) -> Option<InstallOutcome> {
        self.rx.recv().await
    }

    /// Turns a finished installation into the event to surface.
    pub fn finish(&mut self, outcome: InstallOutcome) -> Event {
        self.in_progress = false;
        match outcome {
            InstallOutcome::Installed => {
                info!("codec installation succeeded");
                Event::FatalError(
                    "The required codec was installed. Restart playback to use it.".to_owned(),
                )
            }
            InstallOutcome::Failed(reason) => {
                error!("codec installation failed: {reason}");
                Event::Error(format!("Codec installation failed: {reason}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Installer {
        supported: bool,
        outcome: InstallOutcome,
    }

    impl CodecInstaller for Installer {
        fn is_supported(&self) -> bool {
            self.supported
        }

        fn install(&self, _descriptions: Vec<String>) -> BoxFuture<'static, InstallOutcome> {
            let outcome = self.outcome.clone();
            Box::pin(async move { outcome })
        }
    }

    #[test]
    fn without_installer_error_is_recoverable() {
        let mut codecs = Codecs::default();
        let event = codecs.missing("MPEG-4 AAC decoder".to_owned());
        assert!(matches!(event, Some(Event::Error(_))));
        assert!(!codecs.is_installing());
    }

    #[tokio::test]
    async fn successful_install_is_fatal() {
        let mut codecs = Codecs::new(Some(Arc::new(Installer {
            supported: true,
            outcome: InstallOutcome::Installed,
        })));

        assert_eq!(codecs.missing("AAC".to_owned()), None);
        assert!(codecs.is_installing());
        assert_eq!(codecs.missing("AAC".to_owned()), None);

        let outcome = codecs.completed().await.unwrap();
        assert!(matches!(codecs.finish(outcome), Event::FatalError(_)));
        assert!(!codecs.is_installing());
    }

    #[tokio::test]
    async fn failed_install_is_recoverable() {
        let mut codecs = Codecs::new(Some(Arc::new(Installer {
            supported: true,
            outcome: InstallOutcome::Failed("no network".to_owned()),
        })));

        codecs.missing("AAC".to_owned());
        let outcome = codecs.completed().await.unwrap();
        assert!(matches!(codecs.finish(outcome), Event::Error(_)));
    }

    #[test]
    fn unsupported_installer_is_like_none() {
        let mut codecs = Codecs::new(Some(Arc::new(Installer {
            supported: false,
            outcome: InstallOutcome::Installed,
        })));
        assert!(matches!(codecs.missing("AAC".to_owned()), Some(Event::Error(_))));
    }
}
