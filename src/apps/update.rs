//! The update task: pull the latest source and refresh the images.

use std::sync::Arc;

use super::app::App;
use super::task::TaskKind;
use crate::error::{Error, Result};

impl App {
    /// Update the app source and pull the current images.
    pub async fn update(self: &Arc<Self>) -> Result<()> {
        if self.is_task_running() {
            return Err(Error::Busy);
        }

        // Keep a snapshot of the pre-update state.
        self.backup().await?;

        let app = Arc::clone(self);

        self.run_task(TaskKind::Update, async move {
            app.set_state("updating");

            app.fetcher.pull(&app.source_dir()).await?;

            // The manifest may have changed with the source.
            app.invalidate_manifest().await;
            let manifest = app.manifest().await?;

            for container in &manifest.containers {
                // Locally built images are rebuilt on the next start.
                if container.is_local_build() {
                    continue;
                }

                app.set_state(&format!("pulling image: {}", container.image));
                app.runtime
                    .pull_image(&container.image, &container.tag)
                    .await?;
            }

            Ok(())
        })
        .await
    }
}
