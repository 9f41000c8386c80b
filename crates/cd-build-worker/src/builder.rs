//! Image builder invocation and line-by-line log streaming (spec §4.3 step
//! 6). Grounded on `neptune/src/commands/build.rs`'s `docker.build_image`
//! call: a tar build context piped into bollard, each `BuildInfo.stream`
//! chunk forwarded as it arrives rather than buffered.

use std::io::Cursor;
use std::path::Path;
use std::time::{Duration, Instant};

use bollard::image::BuildImageOptions;
use bollard::models::BuildInfo;
use bollard::Docker;
use bytes::Bytes;
use cd_common::{Error, ErrorKind};
use futures::StreamExt;

pub struct BuildLimits {
    pub max_duration: Duration,
    pub max_artifact_bytes: u64,
}

/// Builds `image_tag` from the recipe at `context_root/Dockerfile`,
/// invoking `on_line` for every log line as it streams in. Enforces
/// `limits.max_duration`; exceeding it surfaces as `ErrorKind::Timeout`
/// with whatever log lines were already delivered to `on_line` preserved by
/// the caller (spec §4.3 step 6).
pub async fn build_image<F>(
    docker: &Docker,
    context_root: &Path,
    image_tag: &str,
    limits: &BuildLimits,
    mut on_line: F,
) -> Result<String, Error>
where
    F: FnMut(&str),
{
    let context = tar_context(context_root)?;
    if context.len() as u64 > limits.max_artifact_bytes {
        return Err(Error::from_kind(ErrorKind::SizeExceeded));
    }

    let options = BuildImageOptions {
        dockerfile: "Dockerfile".to_string(),
        t: image_tag.to_string(),
        rm: true,
        ..Default::default()
    };

    let mut stream = docker.build_image(options, None, Some(Bytes::from(context)));
    let deadline = Instant::now() + limits.max_duration;
    let mut image_id: Option<String> = None;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::from_kind(ErrorKind::Timeout));
        }

        let next = tokio::time::timeout(remaining, stream.next()).await;
        let item = match next {
            Ok(Some(item)) => item,
            Ok(None) => break,
            Err(_) => return Err(Error::from_kind(ErrorKind::Timeout)),
        };

        match item {
            Ok(BuildInfo {
                error: Some(message),
                ..
            }) => {
                return Err(Error::custom(ErrorKind::FrameworkUnknown, message));
            }
            Ok(BuildInfo {
                stream: Some(line), ..
            }) => {
                on_line(line.trim_end());
            }
            Ok(BuildInfo {
                aux: Some(aux), ..
            }) => {
                if let Some(id) = aux.id {
                    image_id = Some(id);
                }
            }
            Ok(_) => {}
            Err(e) => return Err(Error::source(ErrorKind::RegistryUnavailable, e)),
        }
    }

    // Not every docker engine reports an `aux.id`; the tag itself is always
    // a valid reference to the image we just built.
    Ok(image_id.unwrap_or_else(|| image_tag.to_string()))
}

fn tar_context(root: &Path) -> Result<Vec<u8>, Error> {
    let mut buf = Cursor::new(Vec::new());
    {
        let mut archive = tar::Builder::new(&mut buf);
        archive
            .append_dir_all(".", root)
            .map_err(|e| Error::source(ErrorKind::Internal, e))?;
        archive
            .finish()
            .map_err(|e| Error::source(ErrorKind::Internal, e))?;
    }
    Ok(buf.into_inner())
}
