use anyhow::Result;

fn main() -> Result<()> {
    facewatch::recognition::cli::run()
}
