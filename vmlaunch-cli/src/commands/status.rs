use comfy_table::Table;
use comfy_table::presets::NOTHING;
use vmlaunch::lifecycle::RunStateFile;
use vmlaunch::util::is_process_alive;
use vmlaunch_shared::constants::home;

use crate::cli::GlobalFlags;

pub fn execute(global: &GlobalFlags) -> anyhow::Result<()> {
    let file = RunStateFile::new(global.home_dir().join(home::STATE_FILE));
    let Some(state) = file.read()? else {
        println!("No launch is running");
        return Ok(());
    };

    let liveness = |pid: u32| if is_process_alive(pid) { "running" } else { "gone" };

    let mut table = Table::new();
    table.load_preset(NOTHING);
    table.set_header(vec!["ROLE", "PID", "STATE"]);
    table.add_row(vec![
        "launcher".to_string(),
        state.launcher_pid.to_string(),
        liveness(state.launcher_pid).to_string(),
    ]);
    for record in &state.processes {
        table.add_row(vec![
            record.role.to_string(),
            record.pid.to_string(),
            liveness(record.pid).to_string(),
        ]);
    }

    println!("Project: {}", state.project_dir.display());
    println!("{table}");
    Ok(())
}
