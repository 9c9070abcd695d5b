use vmlaunch::host_check::inspect_host;

use crate::cli::{GlobalFlags, LaunchFlags};

pub fn execute(flags: LaunchFlags, global: &GlobalFlags) -> anyhow::Result<()> {
    let options = global.load_options(&flags)?;
    let report = inspect_host(&options);

    for tool in &report.tools {
        match &tool.path {
            Some(path) => println!(
                "ok       {:<12} {} ({})",
                tool.name,
                path.display(),
                tool.purpose
            ),
            None => println!("missing  {:<12} ({})", tool.name, tool.purpose),
        }
    }

    report.into_result()?;
    Ok(())
}
