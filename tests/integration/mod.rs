// Copyright (c) 2025 Kirky.X
//
// Licensed under the MIT License
// See LICENSE file in the project root for full license information.

pub mod api_test;
pub mod helpers;
pub mod http_backend_test;
pub mod queue_flow_test;
