//! Idempotent local image builds.
//!
//! A rebuild must never leave the active tag missing, and the previous
//! image stays available one step back under a known tag:
//!
//! 1. Remove a stale `<image>:turtle-build` if present.
//! 2. Build the context archive into `<image>:turtle-build`.
//! 3. Remove a stale `<image>:turtle-old` if present.
//! 4. Retag the current `<image>:<tag>` to `<image>:turtle-old`.
//! 5. Retag `<image>:turtle-build` to `<image>:<tag>`.
//! 6. Drop the `turtle-build` tag (best effort).

use std::path::Path;

use tracing::error;

use super::{BuildOptions, Runtime};
use crate::error::{Error, Result};

const IMAGE_BUILD_TAG: &str = "turtle-build";
const IMAGE_OLD_TAG: &str = "turtle-old";

/// Build the image `<image_name>:<tag>` from the given context directory.
pub async fn build_local_image(
    runtime: &dyn Runtime,
    image_name: &str,
    tag: &str,
    context_dir: &Path,
) -> Result<()> {
    if image_name.is_empty() || tag.is_empty() {
        return Err(Error::Validation(
            "build image: invalid arguments".to_string(),
        ));
    }

    let build_image = format!("{image_name}:{IMAGE_BUILD_TAG}");
    let old_image = format!("{image_name}:{IMAGE_OLD_TAG}");
    let current_image = format!("{image_name}:{tag}");

    // A leftover build tag from a failed previous run.
    if runtime.image_exists(&build_image).await? {
        runtime.remove_image(&build_image).await?;
    }

    let archive = archive_build_context(context_dir)?;
    let opts = BuildOptions {
        no_cache: true,
        pull: true,
        rm_tmp_container: true,
        force_rm_tmp_container: true,
    };
    runtime.build_image(archive, &build_image, &opts).await?;

    if runtime.image_exists(&old_image).await? {
        runtime.remove_image(&old_image).await?;
    }

    // Keep the previous image one step back under the old tag.
    if runtime.image_exists(&current_image).await? {
        runtime
            .tag_image(&current_image, image_name, IMAGE_OLD_TAG, true)
            .await?;
    }

    runtime
        .tag_image(&build_image, image_name, tag, true)
        .await?;

    if let Err(err) = runtime.remove_image(&build_image).await {
        error!(image = %build_image, %err, "failed to remove temporary build tag");
    }

    Ok(())
}

/// Archive a build context for [`Runtime::build_image`], excluding dot
/// files and dot directories at any depth.
pub fn archive_build_context(dir: &Path) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    append_dir(&mut builder, dir, Path::new(""))?;
    builder
        .into_inner()
        .map_err(|err| Error::Runtime(format!("failed to build context archive: {err}")))
}

fn append_dir(builder: &mut tar::Builder<Vec<u8>>, dir: &Path, prefix: &Path) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }

        let path = entry.path();
        let archive_path = prefix.join(&name);
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            append_dir(builder, &path, &archive_path)?;
        } else if file_type.is_file() {
            builder
                .append_path_with_name(&path, &archive_path)
                .map_err(|err| {
                    Error::Runtime(format!("failed to archive '{}': {err}", path.display()))
                })?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::runtime::{ContainerDetails, ContainerSummary, CreateOptions, EventHandler};

    /// Records image operations so the retag dance can be asserted.
    #[derive(Default)]
    struct RecordingRuntime {
        images: Mutex<HashSet<String>>,
        ops: Mutex<Vec<String>>,
    }

    impl RecordingRuntime {
        fn with_images(images: &[&str]) -> Self {
            Self {
                images: Mutex::new(images.iter().map(|i| i.to_string()).collect()),
                ops: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Runtime for RecordingRuntime {
        async fn list_containers(&self, _all: bool) -> crate::error::Result<Vec<ContainerSummary>> {
            Ok(Vec::new())
        }
        async fn inspect(&self, id: &str) -> crate::error::Result<ContainerDetails> {
            Err(Error::Runtime(format!("container not found: {id}")))
        }
        async fn find_by_name(&self, _name: &str) -> crate::error::Result<Option<ContainerDetails>> {
            Ok(None)
        }
        async fn create(&self, _opts: &CreateOptions) -> crate::error::Result<String> {
            unimplemented!()
        }
        async fn start(&self, _id: &str) -> crate::error::Result<()> {
            unimplemented!()
        }
        async fn stop(&self, _id: &str, _grace: u32) -> crate::error::Result<()> {
            unimplemented!()
        }
        async fn remove(&self, _id: &str, _force: bool) -> crate::error::Result<()> {
            unimplemented!()
        }
        async fn image_exists(&self, reference: &str) -> crate::error::Result<bool> {
            Ok(self.images.lock().unwrap().contains(reference))
        }
        async fn pull_image(&self, _repo: &str, _tag: &str) -> crate::error::Result<()> {
            unimplemented!()
        }
        async fn tag_image(
            &self,
            source: &str,
            repository: &str,
            tag: &str,
            _force: bool,
        ) -> crate::error::Result<()> {
            self.images
                .lock()
                .unwrap()
                .insert(format!("{repository}:{tag}"));
            self.ops
                .lock()
                .unwrap()
                .push(format!("tag {source} {repository}:{tag}"));
            Ok(())
        }
        async fn remove_image(&self, reference: &str) -> crate::error::Result<()> {
            self.images.lock().unwrap().remove(reference);
            self.ops.lock().unwrap().push(format!("rmi {reference}"));
            Ok(())
        }
        async fn build_image(
            &self,
            _archive: Vec<u8>,
            tag: &str,
            opts: &BuildOptions,
        ) -> crate::error::Result<()> {
            assert!(opts.no_cache && opts.pull && opts.rm_tmp_container);
            self.images.lock().unwrap().insert(tag.to_string());
            self.ops.lock().unwrap().push(format!("build {tag}"));
            Ok(())
        }
        async fn logs(
            &self,
            _id: &str,
            _stdout: bool,
            _stderr: bool,
        ) -> crate::error::Result<(String, String)> {
            Ok((String::new(), String::new()))
        }
        fn subscribe(&self, _handler: EventHandler) -> u64 {
            0
        }
        fn unsubscribe(&self, _id: u64) {}
    }

    #[tokio::test]
    async fn rebuild_keeps_a_one_deep_rollback_image() {
        let runtime = RecordingRuntime::with_images(&["web:latest", "web:turtle-old"]);
        let context = tempfile::tempdir().unwrap();
        std::fs::write(context.path().join("Dockerfile"), "FROM scratch\n").unwrap();

        build_local_image(&runtime, "web", "latest", context.path())
            .await
            .unwrap();

        let ops = runtime.ops.lock().unwrap().clone();
        assert_eq!(
            ops,
            [
                "build web:turtle-build",
                "rmi web:turtle-old",
                "tag web:latest web:turtle-old",
                "tag web:turtle-build web:latest",
                "rmi web:turtle-build",
            ]
        );

        let images = runtime.images.lock().unwrap().clone();
        assert!(images.contains("web:latest"));
        assert!(images.contains("web:turtle-old"));
        assert!(!images.contains("web:turtle-build"));
    }

    #[tokio::test]
    async fn first_build_has_no_old_image_to_keep() {
        let runtime = RecordingRuntime::with_images(&[]);
        let context = tempfile::tempdir().unwrap();
        std::fs::write(context.path().join("Dockerfile"), "FROM scratch\n").unwrap();

        build_local_image(&runtime, "web", "latest", context.path())
            .await
            .unwrap();

        let ops = runtime.ops.lock().unwrap().clone();
        assert_eq!(
            ops,
            [
                "build web:turtle-build",
                "tag web:turtle-build web:latest",
                "rmi web:turtle-build",
            ]
        );
    }

    #[test]
    fn build_context_archive_skips_dot_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        std::fs::write(dir.path().join(".env"), "SECRET=1\n").unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/config"), "x").unwrap();
        std::fs::create_dir(dir.path().join("app")).unwrap();
        std::fs::write(dir.path().join("app/main.sh"), "#!/bin/sh\n").unwrap();

        let archive = archive_build_context(dir.path()).unwrap();

        let mut names = Vec::new();
        let mut reader = tar::Archive::new(&archive[..]);
        for entry in reader.entries().unwrap() {
            let entry = entry.unwrap();
            names.push(entry.path().unwrap().to_string_lossy().to_string());
        }

        assert_eq!(names, ["Dockerfile", "app/main.sh"]);
    }
}
