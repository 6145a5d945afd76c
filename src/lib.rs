// Copyright 2019 CoreOS, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! `libbooster` is the PID 1 initramfs runtime, as a library so its
//! components can be exercised by unit tests independent of `main()`.

pub mod blockdev;
pub mod clevis;
pub mod cmdline;
pub mod config;
pub mod console;
pub mod devmapper;
pub mod dhcp;
pub mod io;
pub mod kernel;
pub mod kmsg;
pub mod luks;
pub mod lvm;
pub mod modload;
pub mod network;
pub mod probe;
pub mod rootmount;
pub mod state;
pub mod uevent;
