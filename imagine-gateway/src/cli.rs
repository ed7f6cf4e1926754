use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate images for a prompt
    Generate(GenerateArgs),

    /// Show credential pool status
    Status,

    /// Reload the token file
    Reload,

    /// Clear usage counts and failure flags for every token
    ResetUsage,

    /// Manage stored images
    Images {
        #[command(subcommand)]
        command: ImagesCommand,
    },
}

#[derive(ClapArgs, Debug)]
pub struct GenerateArgs {
    /// Text prompt
    #[arg(short, long)]
    pub prompt: String,

    /// Number of images to keep
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Aspect ratio such as 2:3 or 16:9
    #[arg(long, conflicts_with = "size")]
    pub aspect_ratio: Option<String>,

    /// OpenAI-style size such as 1024x1536, mapped to an aspect ratio
    #[arg(long)]
    pub size: Option<String>,

    /// Print progress events as JSON lines before the result
    #[arg(long)]
    pub stream: bool,

    /// Use this token only, without rotation
    #[arg(long, env = "IMAGINE_CREDENTIAL", hide_env_values = true)]
    pub credential: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum ImagesCommand {
    /// List stored final images, newest first
    List {
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Delete every stored image
    Clear,
}
