use vmlaunch::Launcher;
use vmlaunch::archive::PrepareOutcome;

use crate::cli::{GlobalFlags, LaunchFlags};

pub fn execute(flags: LaunchFlags, global: &GlobalFlags) -> anyhow::Result<()> {
    let options = global.load_options(&flags)?;
    let project_dir = options.project_dir.clone();

    match Launcher::new(options).prepare()? {
        PrepareOutcome::AlreadyPresent => {
            println!("{} already present", project_dir.display());
        }
        PrepareOutcome::Extracted {
            fragments_merged,
            entries,
            archive_removed,
        } => {
            if fragments_merged > 0 {
                println!("Merged {} fragments", fragments_merged);
            }
            println!("Unpacked {} entries into {}", entries, project_dir.display());
            if archive_removed {
                println!("Removed archive");
            }
        }
    }
    Ok(())
}
