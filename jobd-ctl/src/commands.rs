use jobd_core::utils;

pub fn check_requirements() {
    log::info!("Checking job supervision requirements");
    println!("Checking job supervision requirements...\n");

    if utils::is_root() {
        println!("[✓] Running as root");
    } else {
        println!("[✗] NOT running as root (required for privilege drop and cgroup writes)");
    }

    if utils::has_cgroup_v2() {
        println!("[✓] Cgroup v2 available");
    } else {
        println!("[✗] Cgroup v2 NOT available");
    }

    println!("\nPaths:");
    println!("  cgroups:  {}", jobd_cgroup::cgroup::jobs_root_path().display());
    println!("  job data: {}", jobd::fs::jobs_base_dir().display());

    let (uid, gid) = utils::effective_ids();
    println!("\nSystem info:");
    println!("  UID: {}", uid);
    println!("  GID: {}", gid);
}
