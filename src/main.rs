//! Small demo binary: partition a random point cloud, build each rank's local
//! tree, run one full FMM evaluation, and report the global body count back
//! through `Driver::allreduce_sum` as a sanity check.
//!
//! Grounded in the teacher's own `main.rs` MPI bring-up (`mpi::initialize`,
//! `world.split_by_color`).

use mpi::topology::Color;
use mpi::traits::*;
use rand::Rng;

use distributed_fmm::body::Body;
use distributed_fmm::driver::Driver;
use distributed_fmm::kernel::PointMultipole;
use distributed_fmm::types::Config;

fn main() {
    env_logger::init();

    let universe = mpi::initialize().unwrap();
    let world = universe.world();
    let world = world.split_by_color(Color::with_value(0)).unwrap();
    let rank = world.rank();

    let npoints: usize = 1_000;
    let mut rng = rand::thread_rng();
    let bodies: Vec<Body> = (0..npoints)
        .map(|i| Body {
            x: [rng.gen(), rng.gen(), rng.gen()],
            src: 1.0,
            trg: [0.0; 4],
            ibody: i as u64,
            irank: rank,
        })
        .collect();

    let kernel = PointMultipole;
    let config = Config::default();
    let mut driver = Driver::new(world, config, &kernel);

    let bodies = driver.partition(bodies);
    let bodies = driver.comm_bodies(bodies);

    driver.build_tree(&bodies).expect("build_tree");
    driver.upward_pass().expect("upward_pass");

    driver.set_let().expect("set_let");
    let recv_bodies = driver.comm_bodies_let();
    let recv_cells = driver.comm_cells();
    driver.attach_let(recv_cells, recv_bodies).expect("attach_let");

    driver.dual_tree_traversal(false).expect("dual_tree_traversal");
    driver.downward_pass().expect("downward_pass");

    let total = driver.allreduce_sum(bodies.len() as i64);
    if rank == 0 {
        println!("evaluated {} bodies across all ranks", total);
    }
}
