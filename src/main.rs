#[macro_use]
extern crate rocket;

use voxelgate::config;
use voxelgate::server;
use voxelgate::store::VolumeStore;

#[launch]
fn rocket() -> _ {
    let mut store = VolumeStore::new();
    for uuid in config::get_seed_nodes() {
        println!("Seeding node: {}", uuid);
        store.add_node(&uuid);
    }
    server::rocket(store)
}
