pub mod cart;

pub use cart::{
    merge_carts, Cart, CartItem, CART_TTL_DAYS, MAX_ITEMS_PER_CART, MAX_ITEM_QUANTITY,
    MAX_UNIT_PRICE,
};
