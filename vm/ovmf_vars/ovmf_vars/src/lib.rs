// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Provisioning of OVMF variables stores with the default Secure Boot keys.
//!
//! Two short-lived QEMU guests are used. The first boots the UEFI shell and
//! runs `EnrollDefaultKeys.efi` against a writable copy of the template
//! variables store. The second boots a Linux kernel against the resulting
//! store, mapped read-only, and checks that the kernel reports Secure Boot
//! lockdown. Both guests are driven purely through their serial console.

#![forbid(unsafe_code)]

pub mod console;
pub mod enroll;
mod error;
pub mod provision;
pub mod qemu;
pub mod session;
pub mod validate;

pub use error::Error;
pub use provision::BootPayload;
pub use provision::FetchPayload;
pub use provision::FirmwareImages;
pub use provision::GeneratorConfig;
pub use provision::PayloadFile;
pub use provision::provision;
pub use qemu::QemuLauncher;
