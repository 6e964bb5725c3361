// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use fengbo::server::run::run_server;

fn main() {
    if let Err(err) = run_server() {
        eprintln!("fengbo: {err}");
        std::process::exit(1);
    }
}
