use clap::Args;

use super::CliContext;
use hitlgate::schema::write_schema;

#[derive(Args, Debug)]
pub struct SchemaArgs {
    /// Write somewhere other than `<root>/schemas`
    #[arg(long)]
    pub out_dir: Option<std::path::PathBuf>,
}

pub async fn execute(args: SchemaArgs, context: &CliContext) -> anyhow::Result<()> {
    let out_dir = args.out_dir.unwrap_or_else(|| context.root.join("schemas"));
    let written = write_schema(&out_dir)?;
    for file in &written {
        println!("  {}", file);
    }
    println!("Schemas written to {}", out_dir.display());
    Ok(())
}
