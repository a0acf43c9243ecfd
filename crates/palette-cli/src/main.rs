use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use palette_contracts::styles::{
    describe_history, Persisted, StyleEdit, StyleLibrary, StyleProfile,
};
use palette_engine::{
    AspectRatio, DialogueTurn, GenerateOptions, InferenceConfig, PaletteEngine, Resolution,
};
use serde_json::{json, Value};

const DEFAULT_LIBRARY: &str = "paletteai-library.json";
const DEFAULT_OUT: &str = "palette-out";

#[derive(Debug, Parser)]
#[command(name = "palette-rs", version, about = "Reference-driven style analysis and generation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Analyze reference images into a style profile.
    Analyze(AnalyzeArgs),
    /// Print a prompt with style guidance applied.
    Fuse(FuseArgs),
    /// Generate an image from a prompt, optionally styled.
    Generate(GenerateArgs),
    /// Ask the text model about a style or prompt.
    Ask(AskArgs),
    /// Manage saved style profiles.
    #[command(subcommand)]
    Styles(StylesCommand),
}

#[derive(Debug, Args)]
struct SessionArgs {
    #[arg(long, default_value = DEFAULT_OUT)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = DEFAULT_LIBRARY)]
    library: PathBuf,
}

#[derive(Debug, Args)]
struct AnalyzeArgs {
    #[arg(long = "image", required = true, num_args = 1..)]
    images: Vec<PathBuf>,
    /// Store the resulting profile in the library.
    #[arg(long)]
    save: bool,
    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Debug, Args)]
struct FuseArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    style: Option<String>,
    #[arg(long, default_value_t = 0.7)]
    intensity: f64,
    #[arg(long, default_value = DEFAULT_LIBRARY)]
    library: PathBuf,
}

#[derive(Debug, Args)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    style: Option<String>,
    #[arg(long, default_value_t = 0.7)]
    intensity: f64,
    #[arg(long, default_value = "1:1")]
    aspect_ratio: AspectRatio,
    #[arg(long, default_value = "1K")]
    resolution: Resolution,
    #[arg(long = "reference")]
    references: Vec<PathBuf>,
    #[arg(long = "input")]
    inputs: Vec<PathBuf>,
    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Debug, Args)]
struct AskArgs {
    #[arg(long)]
    question: String,
    #[arg(long)]
    style: Option<String>,
    /// JSON array of `{role, content}` turns.
    #[arg(long)]
    history: Option<PathBuf>,
    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Debug, Subcommand)]
enum StylesCommand {
    List(LibraryArg),
    Show(StyleRef),
    History(StyleRef),
    Edit(EditArgs),
    Revert(RevertArgs),
    Delete(StyleRef),
}

#[derive(Debug, Args)]
struct LibraryArg {
    #[arg(long, default_value = DEFAULT_LIBRARY)]
    library: PathBuf,
}

#[derive(Debug, Args)]
struct StyleRef {
    /// Profile id or unique id prefix.
    id: String,
    #[command(flatten)]
    library: LibraryArg,
}

#[derive(Debug, Args)]
struct EditArgs {
    id: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    technique: Option<String>,
    #[arg(long, value_delimiter = ',')]
    palette: Option<Vec<String>>,
    #[arg(long, value_delimiter = ',')]
    moods: Option<Vec<String>>,
    #[arg(long)]
    reasoning: Option<String>,
    #[command(flatten)]
    library: LibraryArg,
}

#[derive(Debug, Args)]
struct RevertArgs {
    id: String,
    #[arg(long)]
    version: u64,
    #[command(flatten)]
    library: LibraryArg,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("palette-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Analyze(args) => run_analyze(args),
        Command::Fuse(args) => run_fuse(args),
        Command::Generate(args) => run_generate(args),
        Command::Ask(args) => run_ask(args),
        Command::Styles(command) => {
            let mut library = StyleLibrary::open(command.library_path());
            report_load_warning(&library);
            let output = run_styles(&mut library, &command)?;
            print_json(&output)?;
            Ok(0)
        }
    }
}

fn open_engine(session: &SessionArgs) -> Result<PaletteEngine> {
    let events_path = session
        .events
        .clone()
        .unwrap_or_else(|| session.out.join("events.jsonl"));
    let config = InferenceConfig::from_env()?;
    PaletteEngine::new(&session.out, events_path, config)
}

fn run_analyze(args: AnalyzeArgs) -> Result<i32> {
    let engine = open_engine(&args.session)?;
    let progress = |label: &str| eprintln!("[analyze] {label}");
    let profile = engine.create_profile(&args.images, Some(&progress))?;
    if args.save {
        let mut library = StyleLibrary::open(&args.session.library);
        report_load_warning(&library);
        let persisted = engine.commit_profile(&mut library, profile.clone(), "created");
        report_persisted(&persisted);
    }
    print_json(&serde_json::to_value(&profile)?)?;
    Ok(0)
}

fn run_fuse(args: FuseArgs) -> Result<i32> {
    let library = StyleLibrary::open(&args.library);
    report_load_warning(&library);
    let style = lookup_style(&library, args.style.as_deref())?;
    let fused = match style {
        Some(profile) => palette_engine::fuse_prompt(
            &args.prompt,
            &palette_engine::StyleHints::from(profile),
            args.intensity,
        ),
        None => args.prompt.clone(),
    };
    println!("{fused}");
    Ok(0)
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let library = StyleLibrary::open(&args.session.library);
    report_load_warning(&library);
    let style = lookup_style(&library, args.style.as_deref())?;
    let engine = open_engine(&args.session)?;
    let record = engine.generate(&GenerateOptions {
        prompt: &args.prompt,
        style,
        intensity: args.intensity,
        aspect_ratio: args.aspect_ratio,
        resolution: args.resolution,
        reference_images: &args.references,
        input_images: &args.inputs,
    })?;
    print_json(&serde_json::to_value(&record)?)?;
    Ok(0)
}

fn run_ask(args: AskArgs) -> Result<i32> {
    let library = StyleLibrary::open(&args.session.library);
    report_load_warning(&library);
    let style = lookup_style(&library, args.style.as_deref())?;
    let history = match &args.history {
        Some(path) => read_history(path)?,
        None => Vec::new(),
    };
    let engine = open_engine(&args.session)?;
    let reply = engine.ask(style, &history, &args.question)?;
    println!("{reply}");
    Ok(0)
}

fn run_styles(library: &mut StyleLibrary, command: &StylesCommand) -> Result<Value> {
    match command {
        StylesCommand::List(_) => Ok(Value::Array(
            library
                .list()
                .iter()
                .map(|profile| {
                    json!({
                        "id": profile.id,
                        "name": profile.name,
                        "version": profile.version,
                        "palette": profile.palette,
                        "updated_at": profile.updated_at,
                    })
                })
                .collect(),
        )),
        StylesCommand::Show(target) => Ok(serde_json::to_value(library.resolve(&target.id)?)?),
        StylesCommand::History(target) => {
            let profile = library.resolve(&target.id)?;
            let steps = describe_history(profile)
                .into_iter()
                .map(|step| {
                    json!({
                        "from_version": step.from_version,
                        "to_version": step.to_version,
                        "changes": step.changes,
                        "description_diff": step.description_diff,
                    })
                })
                .collect::<Vec<Value>>();
            Ok(json!({"id": profile.id, "version": profile.version, "steps": steps}))
        }
        StylesCommand::Edit(args) => {
            let edit = StyleEdit {
                name: args.name.clone(),
                description: args.description.clone(),
                visual_technique: args.technique.clone(),
                palette: args.palette.clone(),
                moods: args.moods.clone(),
                reasoning: args.reasoning.clone(),
            };
            if edit.is_empty() {
                bail!("nothing to edit; pass at least one field flag");
            }
            let (profile, persisted) = library.commit_edit(&args.id, &edit)?;
            report_persisted(&persisted);
            Ok(commit_summary(&profile, &persisted))
        }
        StylesCommand::Revert(args) => {
            let (profile, persisted) = library.revert(&args.id, args.version)?;
            report_persisted(&persisted);
            Ok(commit_summary(&profile, &persisted))
        }
        StylesCommand::Delete(target) => {
            let (profile, persisted) = library.remove(&target.id)?;
            report_persisted(&persisted);
            Ok(json!({
                "deleted": profile.id,
                "name": profile.name,
                "persisted": persisted.is_saved(),
            }))
        }
    }
}

impl StylesCommand {
    fn library_path(&self) -> &Path {
        match self {
            Self::List(arg) => &arg.library,
            Self::Show(target) | Self::History(target) | Self::Delete(target) => {
                &target.library.library
            }
            Self::Edit(args) => &args.library.library,
            Self::Revert(args) => &args.library.library,
        }
    }
}

fn commit_summary(profile: &StyleProfile, persisted: &Persisted) -> Value {
    json!({
        "id": profile.id,
        "name": profile.name,
        "version": profile.version,
        "history_len": profile.history.len(),
        "persisted": persisted.is_saved(),
    })
}

fn lookup_style<'a>(library: &'a StyleLibrary, id: Option<&str>) -> Result<Option<&'a StyleProfile>> {
    id.map(|id| library.resolve(id)).transpose()
}

fn read_history(path: &Path) -> Result<Vec<DialogueTurn>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid dialogue history in {}", path.display()))
}

fn report_load_warning(library: &StyleLibrary) {
    if let Some(warning) = library.load_warning() {
        eprintln!("palette-rs warning: {warning}");
    }
}

fn report_persisted(persisted: &Persisted) {
    if let Persisted::Skipped(reason) = persisted {
        eprintln!("palette-rs warning: style library not saved ({reason}); changes kept for this run only");
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
