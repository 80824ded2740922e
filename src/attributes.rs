//! Built-in attribute lists.
//!
//! `TgTest` polls the standard test device that ships with every control
//! system installation and is handy for checking a setup. `Maxp04` is the
//! beamline list the stress test was written for: camera, electrometer,
//! monochromator, Beckhoff, stepper and Sardana attributes spread over three
//! hosts.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Camera whose acquisition is the load under test
pub const DEFAULT_CAMERA: &str = "haspp04interm:10000/p04/tangovimba/MaxP04_cam";

const TG_TEST: &[&str] = &[
    "sys/tg_test/1/ampli",
    "sys/tg_test/1/boolean_scalar",
    "sys/tg_test/1/double_scalar",
    "sys/tg_test/1/enum_scalar",
    "sys/tg_test/1/float_image_ro",
    "sys/tg_test/1/State",
    "sys/tg_test/1/long_scalar",
];

const MAXP04: &[&str] = &[
    // haspp04interm: cameras
    "haspp04interm:10000/p04/tangovimba/MaxP04_cam/State",
    "haspp04interm:10000/p04/tangovimba/MaxP04_cam/DeviceTemperature",
    // haspp04exp1: steppers, beckhoff, misc
    "haspp04exp1:10000/p04/keithley6517a/exp1_mesh/Current",
    "haspp04exp1:10000/p04/keithley6517a/exp1_mesh/Range",
    "haspp04exp1:10000/p04/keithley6517a/exp1_mesh/State",
    "haspp04exp1:10000/p04/keithley6517a/exp1_mesh/ZeroCheck",
    "haspp04exp1:10000/p04/monop04/exp1.01/EnergyMean",
    "haspp04exp1:10000/p04/monop04/exp1.01/State",
    "haspp04exp1:10000/p04/monop04/exp1.01/Position",
    "haspp04exp1:10000/p04/monop04/exp1.01/Order",
    "haspp04exp1:10000/p04/pyadsadaptor/haspp04beck10_branch1/fast.femto1.target_index",
    "haspp04exp1:10000/p04/pyadsadaptor/haspp04beck10_branch1/fast.femto1_start",
    "haspp04exp1:10000/p04/pyadsadaptor/haspp04beck10_branch1/fast.sample_rate",
    "haspp04exp1:10000/p04/pyadsadaptor/haspp04beck10_branch1/main.cpu_usage",
    "haspp04exp1:10000/p04/pyadsadaptor/haspp04beck10_branch1/main.input7",
    "haspp04exp1:10000/p04/pyadsadaptor/haspp04beck10_branch1/main.input8",
    "haspp04exp1:10000/p04/pyadsadaptor/haspp04beck10_branch1/main.filter_elm_ch1_value",
    "haspp04exp1:10000/p04/pyadsadaptor/haspp04beck10_branch1/fast.femto2.femto_array1",
    "haspp04exp1:10000/p04/pyadsadaptor/haspp04beck10_branch1/fast.femto1.femto_array1",
    "haspp04exp1:10000/p04/motor/exp1_2.01/Position",
    "haspp04exp1:10000/p04/motor/exp1_2.01/State",
    "haspp04exp1:10000/p04/motor/exp1_2.02/Position",
    "haspp04exp1:10000/p04/motor/exp1_2.02/State",
    "haspp04exp1:10000/p04/motor/exp1_2.03/Position",
    "haspp04exp1:10000/p04/motor/exp1_2.03/State",
    "haspp04exp1:10000/p04/motor/exp1_2.04/Position",
    "haspp04exp1:10000/p04/motor/exp1_2.04/State",
    "haspp04exp1:10000/p04/motor/exp1_2.05/Position",
    "haspp04exp1:10000/p04/motor/exp1_2.05/State",
    "haspp04exp1:10000/p04/motor/exp1_2.06/Position",
    "haspp04exp1:10000/p04/motor/exp1_2.06/State",
    // haspp04max: sardana elements, smaract
    "haspp04max:10000/motor/piezojenactrl/0/Position",
    "haspp04max:10000/motor/tm_rmucoordinate_rmu1_hrotz/1/Position",
    "haspp04max:10000/motor/tm_rmucoordinate_rmu1_hrotz/1/State",
    "haspp04max:10000/motor/tm_rmucoordinate_rmu1_vrotx/1/Position",
    "haspp04max:10000/motor/tm_rmucoordinate_rmu1_vrotx/1/State",
    "haspp04max:10000/motor/tm_rmucoordinate_rmu1_hx/1/Position",
    "haspp04max:10000/motor/tm_rmucoordinate_rmu1_hx/1/State",
    "haspp04max:10000/motor/tm_rmucoordinate_rmu1_hz/1/Position",
    "haspp04max:10000/motor/tm_rmucoordinate_rmu1_hz/1/State",
    "haspp04max:10000/motor/tm_rmucoordinate_rmu1_vx/1/Position",
    "haspp04max:10000/motor/tm_rmucoordinate_rmu1_vx/1/State",
    "haspp04max:10000/motor/vm_br1_exitslit/1/Position",
    "haspp04max:10000/motor/vm_br1_exitslit/1/State",
    "haspp04max:10000/motor/vm_br1_master/1/Position",
    "haspp04max:10000/motor/vm_br1_master/1/State",
];

/// Named attribute list selectable from the command line or config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum AttributePreset {
    /// Beamline attributes on the three P04 hosts
    #[default]
    Maxp04,
    /// Test device attributes
    TgTest,
}

impl AttributePreset {
    /// Attribute names in polling (and column) order
    pub fn attributes(self) -> Vec<String> {
        let list = match self {
            AttributePreset::Maxp04 => MAXP04,
            AttributePreset::TgTest => TG_TEST,
        };
        list.iter().map(|s| (*s).to_string()).collect()
    }
}
