use dexpatch::dex::{DexFile, DexIntegrity};
use dexpatch::patch::{DeobfuscationPipeline, XorStringRule};
use std::env;
use std::error::Error;
use std::path::Path;

// Deobfuscates a DEX file: finds the known XOR string helpers, decodes the
// strings they hide, adds them to the string pool and patches every caller to
// return the decoded value directly. Writes a sibling copy_<name> file; the
// input is never modified.

//Usage: deobfuscate <dex-file>
fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: {} <dex-file>", args[0]);
        std::process::exit(1);
    }

    match process_dex(&args[1]) {
        Ok(_) => {}
        Err(e) => eprintln!("Aborted due to error: {e}"),
    }
}

/* This is where all the processing takes place, to make error handling easier */
fn process_dex(dex_path: &str) -> Result<(), Box<dyn Error>> {
    let input = Path::new(dex_path);
    let mut dex = DexFile::from_file(input)?;

    let integrity = DexIntegrity;
    let summary = DeobfuscationPipeline::new(&mut dex, input, &integrity)?
        .with_rule(Box::new(XorStringRule))
        .run()?;

    println!(
        "{} helper(s) found, {} string(s) interned, {} caller(s) patched",
        summary.helpers_found, summary.strings_interned, summary.callers_patched
    );
    println!("Wrote patched copy to {}", summary.output_path.display());
    Ok(())
}
