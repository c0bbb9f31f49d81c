use std::{env, path::Path, process};

use anyhow::{anyhow, Context, Result};
use log::debug;

use rigconv::{
    conversion::{Asset, Exporter, Importer, Scene},
    format::{self, gltf::GltfExporter},
};

fn main() {
    let arguments: Vec<String> = env::args().skip(1).collect();
    let verbose = arguments
        .iter()
        .any(|argument| argument == "--verbose" || argument == "-v");
    let paths: Vec<&String> = arguments
        .iter()
        .filter(|argument| !argument.starts_with('-'))
        .collect();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if verbose { "debug" } else { "info" }),
    )
    .init();

    let (input, output) = match paths.as_slice() {
        [input, output] => (input.as_str(), output.as_str()),
        _ => {
            eprintln!("usage: rigconv [--verbose|-v] <input> <output.gltf|output.glb>");
            process::exit(2);
        }
    };

    if let Err(error) = run(input, output) {
        eprintln!("error: {:#}", error);
        process::exit(1);
    }
}

fn run(input: &str, output: &str) -> Result<()> {
    let extension = extension_of(output);
    if extension != "gltf" && extension != "glb" {
        return Err(anyhow!(
            "The output must be a .gltf or .glb file, got '{}'",
            output
        ));
    }

    let importer = select_importer(input)?;
    let bytes = std::fs::read(input).with_context(|| format!("Failed to read '{}'", input))?;

    let mut scene = Scene::default();
    importer.import(&Asset::new(bytes, input), &mut scene)?;
    importer.postprocess(&mut scene);
    debug!(
        "Imported '{}': {} nodes, {} meshes",
        input,
        scene.nodes.len(),
        scene.meshes.len()
    );

    let assets = GltfExporter::new(output).export(&scene)?;
    for asset in &assets {
        std::fs::write(asset.path(), &asset.bytes)
            .with_context(|| format!("Failed to write '{}'", asset.path().display()))?;
    }

    println!(
        "{}: {} nodes, {} meshes, {} joints, {} animations",
        output,
        scene.nodes.len(),
        scene.meshes.len(),
        scene.skeleton.len(),
        scene.animations.len()
    );

    Ok(())
}

fn select_importer(input: &str) -> Result<Box<dyn Importer>> {
    let extension = extension_of(input);
    let importers = format::importers();

    let supported: Vec<String> = importers
        .iter()
        .flat_map(|importer| importer.extensions())
        .map(|extension| extension.to_string())
        .collect();

    importers
        .into_iter()
        .find(|importer| importer.extensions().contains(&extension.as_str()))
        .ok_or_else(|| {
            anyhow!(
                "No importer handles '.{}' files (supported: {})",
                extension,
                supported.join(", ")
            )
        })
}

fn extension_of(path: &str) -> String {
    Path::new(path)
        .extension()
        .and_then(|extension| extension.to_str())
        .map(|extension| extension.to_ascii_lowercase())
        .unwrap_or_default()
}
