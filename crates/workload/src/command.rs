//! Command stream records.
//!
//! One record per line, comma separated, tagged by its first field:
//!
//! | tag | fields                                   |
//! |-----|------------------------------------------|
//! | `N` | `c,w,d,m`, then `m` lines `item,supply_w,qty` |
//! | `P` | `w,d,c,amount`                           |
//! | `D` | `w,carrier`                              |
//! | `O` | `w,d,c`                                  |
//! | `S` | `w,d,threshold,last_n`                   |
//! | `I` | `w,d,last_n`                             |
//! | `T` |                                          |
//! | `R` | `w,d,c`                                  |
//!
//! Blank lines are skipped. Anything else that does not parse ends the
//! stream.

use std::io::{BufRead, Lines};
use std::str::FromStr;

use common::{CustomerKey, DistrictKey, Money};
use saga::{NewOrderRequest, OrderLineRequest, PaymentRequest};

use crate::error::ParseError;

/// Upper bound on the order lines reserved up front. The declared count is
/// untrusted until the lines are actually read.
const MAX_PREALLOCATED_LINES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    NewOrder(NewOrderRequest),
    Payment(PaymentRequest),
    Delivery {
        warehouse_id: i32,
        carrier_id: i32,
    },
    OrderStatus(CustomerKey),
    StockLevel {
        district: DistrictKey,
        threshold: i32,
        last_orders: i64,
    },
    PopularItem {
        district: DistrictKey,
        last_orders: i64,
    },
    TopBalance,
    RelatedCustomer(CustomerKey),
}

/// Command type, used as a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    NewOrder,
    Payment,
    Delivery,
    OrderStatus,
    StockLevel,
    PopularItem,
    TopBalance,
    RelatedCustomer,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::NewOrder => "new_order",
            CommandKind::Payment => "payment",
            CommandKind::Delivery => "delivery",
            CommandKind::OrderStatus => "order_status",
            CommandKind::StockLevel => "stock_level",
            CommandKind::PopularItem => "popular_item",
            CommandKind::TopBalance => "top_balance",
            CommandKind::RelatedCustomer => "related_customer",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::NewOrder(_) => CommandKind::NewOrder,
            Command::Payment(_) => CommandKind::Payment,
            Command::Delivery { .. } => CommandKind::Delivery,
            Command::OrderStatus(_) => CommandKind::OrderStatus,
            Command::StockLevel { .. } => CommandKind::StockLevel,
            Command::PopularItem { .. } => CommandKind::PopularItem,
            Command::TopBalance => CommandKind::TopBalance,
            Command::RelatedCustomer(_) => CommandKind::RelatedCustomer,
        }
    }
}

/// The comma-separated fields of one line.
struct Record<'a> {
    line: usize,
    fields: Vec<&'a str>,
}

impl<'a> Record<'a> {
    fn new(line: usize, text: &'a str) -> Self {
        Self {
            line,
            fields: text.split(',').map(str::trim).collect(),
        }
    }

    fn expect_len(&self, tag: &'static str, expected: usize) -> Result<(), ParseError> {
        if self.fields.len() != expected {
            return Err(ParseError::FieldCount {
                line: self.line,
                tag,
                expected,
                found: self.fields.len(),
            });
        }
        Ok(())
    }

    fn number<T: FromStr>(&self, index: usize, field: &'static str) -> Result<T, ParseError> {
        let value = self.fields.get(index).copied().unwrap_or_default();
        value.parse().map_err(|_| ParseError::InvalidField {
            line: self.line,
            field,
            value: value.to_string(),
        })
    }

    fn money(&self, index: usize) -> Result<Money, ParseError> {
        let value = self.fields.get(index).copied().unwrap_or_default();
        value.parse().map_err(|source| ParseError::InvalidAmount {
            line: self.line,
            source,
        })
    }
}

/// Reads [`Command`]s from a line-oriented source.
///
/// Yields `None` at end of stream. After an error the caller is expected to
/// stop reading.
pub struct CommandReader<R> {
    lines: Lines<R>,
    line: usize,
}

impl<R: BufRead> CommandReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line: 0,
        }
    }

    /// Number of the last line consumed, 1-based.
    pub fn line(&self) -> usize {
        self.line
    }

    fn next_line(&mut self) -> Option<Result<String, ParseError>> {
        let next = self.lines.next()?;
        self.line += 1;
        Some(next.map_err(ParseError::from))
    }

    fn parse(&mut self, text: &str) -> Result<Command, ParseError> {
        let record = Record::new(self.line, text);
        let tag = record.fields[0];

        match tag {
            "N" => {
                record.expect_len("N", 5)?;
                let customer = CustomerKey::new(
                    record.number(2, "warehouse")?,
                    record.number(3, "district")?,
                    record.number(1, "customer")?,
                );
                let count: usize = record.number(4, "line count")?;
                let lines = self.order_lines(count)?;
                Ok(Command::NewOrder(NewOrderRequest { customer, lines }))
            }
            "P" => {
                record.expect_len("P", 5)?;
                let customer = CustomerKey::new(
                    record.number(1, "warehouse")?,
                    record.number(2, "district")?,
                    record.number(3, "customer")?,
                );
                Ok(Command::Payment(PaymentRequest::new(
                    customer,
                    record.money(4)?,
                )))
            }
            "D" => {
                record.expect_len("D", 3)?;
                Ok(Command::Delivery {
                    warehouse_id: record.number(1, "warehouse")?,
                    carrier_id: record.number(2, "carrier")?,
                })
            }
            "O" => {
                record.expect_len("O", 4)?;
                Ok(Command::OrderStatus(CustomerKey::new(
                    record.number(1, "warehouse")?,
                    record.number(2, "district")?,
                    record.number(3, "customer")?,
                )))
            }
            "S" => {
                record.expect_len("S", 5)?;
                Ok(Command::StockLevel {
                    district: DistrictKey::new(
                        record.number(1, "warehouse")?,
                        record.number(2, "district")?,
                    ),
                    threshold: record.number(3, "threshold")?,
                    last_orders: record.number(4, "last orders")?,
                })
            }
            "I" => {
                record.expect_len("I", 4)?;
                Ok(Command::PopularItem {
                    district: DistrictKey::new(
                        record.number(1, "warehouse")?,
                        record.number(2, "district")?,
                    ),
                    last_orders: record.number(3, "last orders")?,
                })
            }
            "T" => {
                record.expect_len("T", 1)?;
                Ok(Command::TopBalance)
            }
            "R" => {
                record.expect_len("R", 4)?;
                Ok(Command::RelatedCustomer(CustomerKey::new(
                    record.number(1, "warehouse")?,
                    record.number(2, "district")?,
                    record.number(3, "customer")?,
                )))
            }
            other => Err(ParseError::UnknownCommand {
                line: self.line,
                tag: other.to_string(),
            }),
        }
    }

    fn order_lines(&mut self, count: usize) -> Result<Vec<OrderLineRequest>, ParseError> {
        let mut lines = Vec::with_capacity(count.min(MAX_PREALLOCATED_LINES));
        while lines.len() < count {
            let Some(text) = self.next_line() else {
                return Err(ParseError::TruncatedOrder {
                    line: self.line,
                    expected: count,
                    found: lines.len(),
                });
            };
            let text = text?;
            let record = Record::new(self.line, &text);
            record.expect_len("order line", 3)?;
            lines.push(OrderLineRequest {
                item_id: record.number(0, "item")?,
                supply_warehouse_id: record.number(1, "supply warehouse")?,
                quantity: record.number(2, "quantity")?,
            });
        }
        Ok(lines)
    }
}

impl<R: BufRead> Iterator for CommandReader<R> {
    type Item = Result<Command, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let text = match self.next_line()? {
                Ok(text) => text,
                Err(err) => return Some(Err(err)),
            };
            if text.trim().is_empty() {
                continue;
            }
            return Some(self.parse(text.trim()));
        }
    }
}
