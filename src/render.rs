use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use camino::{Utf8Path, Utf8PathBuf};

use crate::DotRenderer;

/// How long a job waits for its spawned renderer to exit. The child is not
/// killed when the wait elapses; the artifact check decides the job outcome
/// either way.
const WAIT_CHILD: Duration = Duration::from_secs(60);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How a finished job came by its image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rendered {
    /// The renderer process ran and the image now exists.
    Fresh,
    /// Every required artifact already existed, nothing was spawned.
    Cached,
}

/// One unit of work: a single source file paired with its expected artifacts.
pub(crate) struct Job {
    pub(crate) source: Utf8PathBuf,
    program: String,
    image: Utf8PathBuf,
    map: Option<Utf8PathBuf>,
}

impl Job {
    /// Pairs `source` with the image it should produce in the output
    /// directory and, unless simple mode is on, the image map emitted next to
    /// the source file. All paths are absolutized up front, since the
    /// renderer runs with its working directory set to the source's parent.
    pub(crate) fn new(renderer: &DotRenderer, source: &Utf8Path) -> anyhow::Result<Self> {
        let source = camino::absolute_utf8(source)?;
        let name = source
            .file_name()
            .ok_or_else(|| anyhow!("'{source}' has no file name"))?;

        let image = camino::absolute_utf8(renderer.output_dir.join(name))?.with_extension("png");
        let map = match renderer.simple {
            true => None,
            false => Some(source.with_extension("map")),
        };

        Ok(Self {
            source,
            program: renderer.program.clone(),
            image,
            map,
        })
    }

    /// An existing artifact is authoritative, even if the source file changed
    /// after it was produced.
    fn is_rendered(&self) -> bool {
        self.image.exists() && self.map.as_deref().is_none_or(Utf8Path::exists)
    }

    pub(crate) fn run(&self) -> anyhow::Result<Rendered> {
        if self.is_rendered() {
            tracing::debug!("{} is already rendered, skipping", self.source);
            return Ok(Rendered::Cached);
        }

        self.invoke()?;

        if !self.image.exists() {
            return Err(anyhow!(
                "Image {} was not created. Make sure Graphviz is installed correctly.",
                self.image
            ));
        }

        Ok(Rendered::Fresh)
    }

    fn invoke(&self) -> anyhow::Result<()> {
        let dir = self
            .source
            .parent()
            .ok_or_else(|| anyhow!("'{}' has no parent directory", self.source))?;
        let name = self
            .source
            .file_name()
            .ok_or_else(|| anyhow!("'{}' has no file name", self.source))?;

        let mut command = Command::new(&self.program);
        command
            .arg(name)
            .arg("-Tpng")
            .arg(format!("-o{}", self.image));

        if let Some(map) = &self.map {
            command.arg("-Tcmapx").arg(format!("-o{map}"));
        }

        // The renderer's own output stays visible live, never captured.
        let mut child = command
            .current_dir(dir)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| anyhow!("Couldn't start '{}': {e}", self.program))?;

        let deadline = Instant::now() + WAIT_CHILD;

        loop {
            match child.try_wait()? {
                Some(status) => {
                    if !status.success() {
                        tracing::debug!(
                            "'{}' exited with {status} for {}",
                            self.program,
                            self.source
                        );
                    }
                    return Ok(());
                }
                None if Instant::now() >= deadline => {
                    tracing::warn!(
                        "'{}' is still running on {} after {}s, giving up the wait",
                        self.program,
                        self.source,
                        WAIT_CHILD.as_secs()
                    );
                    return Ok(());
                }
                None => thread::sleep(POLL_INTERVAL),
            }
        }
    }
}
