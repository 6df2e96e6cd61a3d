// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// PAL: Platform Abstraction Layer
//======================================================================================================================

// Hides platform details: cache geometry and, on Linux, POSIX shared memory for cross-process regions.

pub mod arch;

#[cfg(target_os = "linux")]
pub mod linux;
