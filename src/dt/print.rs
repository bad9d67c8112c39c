//! Debug dump of the parsed device tree.

use super::{CellList, DeviceStatus, DeviceTree, NodeId, PropertyValue};

impl DeviceTree {
    /// Print the whole node tree with every typed property. Debug use only.
    pub fn dump(&self) {
        println_k!();
        println_k!("////////// device tree ////////////");
        for region in self.reserved_regions() {
            println_k!("reserved: {:#x} ({:#x} bytes)", region.address, region.size);
        }
        if let Some(root) = self.root() {
            self.dump_node(root, 0);
        }
        println_k!(
            "arena: {} of {} bytes used",
            self.arena.used(),
            self.arena.capacity()
        );
        println_k!();
    }

    fn dump_node(&self, id: NodeId, depth: usize) {
        let pad = depth * 2;
        println_k!("{:pad$}{}/", "", self.node(id).name, pad = pad);

        for prop in self.properties(id) {
            print_k!("{:pad$}  {}: ", "", prop.name, pad = pad);
            match &prop.value {
                PropertyValue::Raw(raw) => {
                    println_k!("<{} raw byte(s)>", raw.len());
                }
                PropertyValue::Compatible(list) => {
                    for (i, s) in list.iter().enumerate() {
                        if i > 0 {
                            print_k!(", ");
                        }
                        print_k!("\"{}\"", s);
                    }
                    println_k!();
                }
                PropertyValue::Model(model) => println_k!("\"{}\"", model),
                PropertyValue::Phandle(phandle) => println_k!("{}", phandle),
                PropertyValue::Status(status) => match status {
                    DeviceStatus::Okay => println_k!("okay"),
                    DeviceStatus::Disabled => println_k!("disabled"),
                    DeviceStatus::Reserved => println_k!("reserved"),
                    DeviceStatus::Fail => println_k!("fail"),
                    DeviceStatus::FailCondition(reason) => println_k!("fail-{}", reason),
                },
                PropertyValue::AddressCells(cells) => println_k!("{}", cells),
                PropertyValue::SizeCells(cells) => println_k!("{}", cells),
                PropertyValue::DmaCoherent(coherent) => println_k!("{}", coherent),
                PropertyValue::DeviceType(device_type) => println_k!("\"{}\"", device_type),
                PropertyValue::Reg(reg) => {
                    for i in 0..reg.pairs as usize {
                        if i > 0 {
                            print_k!(", ");
                        }
                        print_k!("(addr: ");
                        dump_cell(&reg.addresses, i);
                        print_k!(", size: ");
                        dump_cell(&reg.sizes, i);
                        print_k!(")");
                    }
                    println_k!();
                }
                PropertyValue::Ranges(ranges) | PropertyValue::DmaRanges(ranges) => {
                    for i in 0..ranges.triplets as usize {
                        if i > 0 {
                            print_k!(", ");
                        }
                        print_k!("(child: ");
                        dump_cell(&ranges.child_addrs, i);
                        print_k!(", parent: ");
                        dump_cell(&ranges.parent_addrs, i);
                        print_k!(", len: ");
                        dump_cell(&ranges.lengths, i);
                        print_k!(")");
                    }
                    println_k!();
                }
            }
        }

        for child in self.children(id) {
            self.dump_node(child, depth + 1);
        }
    }
}

fn dump_cell(list: &CellList, i: usize) {
    match list.get(i) {
        Some(value) => print_k!("{:#x}", value),
        None => print_k!("n/a"),
    }
}
