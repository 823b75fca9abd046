extern crate fiberio;

use fiberio::{sched, spawn};

fn main() {
    env_logger::init();

    let coro = spawn(|| {
        println!("pong 1");
        sched();
        println!("pong 2");
    });

    println!("ping 1");
    coro.resume().unwrap();
    println!("ping 2");
    coro.resume().unwrap();
    println!("done, coroutine state: {:?}", coro.state());
}
