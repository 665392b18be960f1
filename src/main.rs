use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use us_reconstruct::{
    Orientation, ReconstructOutcome, ReconstructParams, Reconstructer, SessionLoader,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let mut args = std::env::args().skip(1);
    let Some(session) = args.next().map(PathBuf::from) else {
        bail!("usage: us-reconstruct <session.mhd> [settings.toml] [output.mhd]");
    };
    let params = match args.next() {
        Some(path) => ReconstructParams::load(Path::new(&path))
            .with_context(|| format!("failed to load settings from {path}"))?,
        None => ReconstructParams::default(),
    };
    let output = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("volume.mhd"));

    let data = SessionLoader::load(&session)
        .with_context(|| format!("failed to load session {}", session.display()))?;

    let reconstructer = Reconstructer::new(params);
    reconstructer.subscribe(|event| log::debug!("{event:?}"));
    reconstructer.set_input_data(data)?;

    let task = reconstructer.spawn_reconstruct()?;
    let volume = match task.await? {
        ReconstructOutcome::Finished(volume) => volume,
        ReconstructOutcome::Cancelled => bail!("reconstruction was cancelled"),
    };

    volume
        .save_metaimage(&output)
        .with_context(|| format!("failed to write {}", output.display()))?;

    let image = volume
        .get_image_from_axis(volume.dim().0 / 2, Orientation::Axial)
        .context("should have returned image at center of volume")?;
    image.save(output.with_extension("png"))?;
    Ok(())
}
