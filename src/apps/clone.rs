//! The clone-source task.

use std::sync::Arc;

use super::app::App;
use super::task::TaskKind;
use crate::error::Result;
use crate::source::SourceFetcher;

impl App {
    /// Clone the app source in a new task.
    pub(crate) async fn clone_source(self: &Arc<Self>) -> Result<()> {
        let app = Arc::clone(self);

        self.run_task(TaskKind::CloneSource, async move {
            app.set_state("cloning source");

            let (url, branch) = {
                let settings = app.settings.lock().unwrap();
                (settings.source_url.clone(), settings.branch.clone())
            };

            SourceFetcher::clone_into(&*app.fetcher, &url, &branch, &app.source_dir()).await
        })
        .await
    }
}
